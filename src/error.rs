//! Error types for the Ratewarden service.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum RateWardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors that are not tied to a specific backend
    #[error("Store error: {0}")]
    Store(String),

    /// The store did not answer within the configured bound
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Redis errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RateWardenError {
    fn from(err: config::ConfigError) -> Self {
        RateWardenError::Config(err.to_string())
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RateWardenError>;
