//! Error types for the Gatekeeper engine.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatekeeper operations.
///
/// Errors only surface from construction and connection. The decision path
/// converts every backend failure into a fail-open decision instead.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Redis connection or command errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The backing store did not answer in time
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// A script returned something other than the expected reply shape
    #[error("Malformed script reply: {0}")]
    MalformedReply(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
