//! Error types for Parampara Webhooks
//!
//! Crate-level errors for startup and configuration. Request-path failures
//! live in [`crate::stripe::error`] and map onto HTTP responses there.

use thiserror::Error;

use crate::stripe::error::StripeWebhookError;

/// The main error type for Parampara Webhooks operations
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Webhook pipeline errors
    #[error("Webhook error: {0}")]
    Webhook(#[from] StripeWebhookError),

    /// I/O errors (bind, accept)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Result type alias for Parampara Webhooks operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a generic error from a string
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        Error::Generic(msg.into())
    }

    /// Create a configuration error from a string
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }
}
