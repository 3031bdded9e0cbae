//! ClawBridge error types

use thiserror::Error;

/// ClawBridge error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session error
    #[error("Session error: {0}")]
    Session(String),

    /// Launcher error
    #[error("Launcher error: {0}")]
    Launcher(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Plugin middleware error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Persistence error
    #[error("Store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for ClawBridge operations
pub type Result<T> = std::result::Result<T, Error>;
