//! iso-switch-sim: a mock ISO 8583 switch.
//!
//! Emulates the switch side of a biller integration over a single TCP port:
//! - Two-byte length-prefix framing
//! - Sign-on acknowledgement and canned payment responses selected by a
//!   routing token embedded in the request
//! - Actor-owned session registry with bounded per-session mailboxes
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod framing;
pub mod iso;
pub mod responder;
pub mod server;
pub mod session;
