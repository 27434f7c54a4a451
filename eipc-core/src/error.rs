//! Error types for the eipc tunnel client
//!
//! This module defines all error types used throughout the application,
//! providing consistent error handling and user-friendly error messages.

use thiserror::Error;

/// Main error type for the eipc application
#[derive(Error, Debug)]
pub enum EipError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors raised while acquiring provider configuration
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// Errors raised before the tunnel subprocess could be spawned
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    /// Errors related to driving the connection state machine
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Unknown provider domain: {domain}")]
    UnknownProvider { domain: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Provider bootstrap errors, one variant per bootstrap stage
///
/// Each variant names the stage that failed so callers can surface
/// exactly where the sequence broke off.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("Could not resolve provider domain {domain}: {reason}")]
    NameResolution { domain: String, reason: String },

    #[error("Secure transport to {domain} failed: {reason}")]
    Transport { domain: String, reason: String },

    #[error("CA certificate could not be obtained from {domain}: {reason}")]
    Certificate { domain: String, reason: String },

    #[error("Provider {domain} speaks API version {got}, supported: {supported}")]
    UnsupportedApi {
        domain: String,
        got: String,
        supported: String,
    },

    #[error("Provider {domain} requires client version {required}, this is {current}")]
    UnsupportedClient {
        domain: String,
        required: String,
        current: String,
    },

    #[error("No cached provider configuration for {domain}")]
    NoCachedConfig { domain: String },
}

/// Errors detected before the tunnel subprocess is spawned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Tunnel binary {binary} not found in PATH")]
    BinaryNotFound { binary: String },

    #[error("Elevation tool {tool} not found in PATH")]
    ElevationToolMissing { tool: String },

    #[error("No privilege elevation agent is running")]
    ElevationAgentMissing,

    #[error("Another tunnel instance is already running (pid {pid})")]
    AlreadyRunning { pid: u32, foreign: bool },

    #[error("Failed to spawn tunnel process: {reason}")]
    Spawn { reason: String },
}

/// Errors returned by state machine commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("The connection manager has shut down")]
    ManagerGone,
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EipError>;
