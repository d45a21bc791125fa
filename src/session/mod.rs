//! Client sessions.
//!
//! - `registry`: slab-backed set of live sessions and their mailboxes
//! - `manager`: actor task that owns the registry and routes inbound bytes
//! - `connection`: per-session read and write loops

pub mod connection;
pub mod manager;
pub mod registry;

pub use connection::{Session, SessionFault, SessionSettings};
pub use manager::{ManagerHandle, SessionManager};
pub use registry::{Delivery, SessionId, SessionRegistry};
