//! Error types for the Gatehouse gateway.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Gatehouse operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors surfaced outside the admission path
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// Metric registration errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

/// Result type alias for Gatehouse operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
