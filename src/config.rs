//! Configuration module for the ISO switch simulator.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the simulator
#[derive(Parser, Debug)]
#[command(name = "iso-switch-sim")]
#[command(author = "iso-switch-sim authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Mock switch for simulating biller requests and responses",
    long_about = "Mock switch that speaks length-prefixed ISO 8583 over TCP, answering \
                  sign-on and payment requests with canned responses"
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the ISO 8583 TCP server
    Iso(IsoArgs),
}

#[derive(Args, Debug)]
pub struct IsoArgs {
    /// Address to bind to (e.g., 127.0.0.1:8091)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent sessions
    #[arg(short = 'm', long)]
    pub max_sessions: Option<usize>,

    /// Inbound message dispatch (unicast, broadcast)
    #[arg(long, value_enum)]
    pub dispatch: Option<DispatchMode>,
}

/// How inbound messages reach session mailboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// Only the sending session receives its message.
    #[default]
    Unicast,
    /// Every registered session receives every message.
    Broadcast,
}

/// What to send back for a request that matches no marker or token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnrecognizedPolicy {
    /// A frame with a zero length header and no body.
    #[default]
    EmptyFrame,
    /// A zero-byte write.
    Silent,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Per-session mailbox capacity
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub dispatch: DispatchMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            mailbox_capacity: default_mailbox_capacity(),
            backlog: default_backlog(),
            dispatch: DispatchMode::default(),
        }
    }
}

/// Session timeouts, in seconds (0 = disabled)
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Close a session that sends nothing for this long
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Close a session whose socket does not accept a reply within this long
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ResponderConfig {
    #[serde(default)]
    pub unrecognized: UnrecognizedPolicy,
}

#[derive(Debug, Deserialize, Default)]
pub struct CodecConfig {
    /// Stamp date/time fields with the current local time
    #[serde(default)]
    pub live_timestamps: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8091".to_string()
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_backlog() -> i32 {
    1024
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_write_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_sessions: usize,
    pub mailbox_capacity: usize,
    pub backlog: i32,
    pub dispatch: DispatchMode,
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub unrecognized: UnrecognizedPolicy,
    pub live_timestamps: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(None, TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let Command::Iso(ref args) = cli.command;
        let mut config = Config::merge(Some(args), toml_config);
        if cli.log_level != "info" {
            config.log_level = cli.log_level.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn merge(args: Option<&IsoArgs>, toml_config: TomlConfig) -> Self {
        let listen = args.and_then(|a| a.listen.clone());
        let max_sessions = args.and_then(|a| a.max_sessions);
        let dispatch = args.and_then(|a| a.dispatch);

        Config {
            listen: listen.unwrap_or(toml_config.server.listen),
            max_sessions: max_sessions.unwrap_or(toml_config.server.max_sessions),
            mailbox_capacity: toml_config.server.mailbox_capacity,
            backlog: toml_config.server.backlog,
            dispatch: dispatch.unwrap_or(toml_config.server.dispatch),
            idle_timeout: secs(toml_config.session.idle_timeout_secs),
            write_timeout: secs(toml_config.session.write_timeout_secs),
            unrecognized: toml_config.responder.unrecognized,
            live_timestamps: toml_config.codec.live_timestamps,
            log_level: toml_config.logging.level,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid("server.mailbox_capacity must be at least 1"));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("server.max_sessions must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
