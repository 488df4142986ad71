//! Stripe Webhook Errors
//!
//! Rejections produced before any handler runs, plus the umbrella error the
//! HTTP layer turns into a response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Why an inbound delivery failed authentication.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// Header absent or empty
    #[error("Missing stripe-signature header")]
    MissingSignature,

    /// Header present but not `t=<ts>,v1=<hex>`
    #[error("Invalid signature header format: {0}")]
    InvalidSignatureFormat(String),

    /// No `v1` entry matched the expected HMAC
    #[error("No signatures found matching the expected signature for payload")]
    SignatureMismatch,

    /// Timestamp outside the replay window
    #[error("Timestamp outside the tolerance zone (age {age_secs}s, tolerance {tolerance_secs}s)")]
    StaleTimestamp {
        /// Absolute distance from now in seconds
        age_secs: i64,
        /// Configured tolerance in seconds
        tolerance_secs: i64,
    },

    /// Signature valid but the body is not a webhook event
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl VerificationError {
    /// Short machine-readable kind used for incidents and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingSignature => "missing_signature",
            Self::InvalidSignatureFormat(_) => "invalid_signature_format",
            Self::SignatureMismatch => "signature_mismatch",
            Self::StaleTimestamp { .. } => "stale_timestamp",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}

/// Structural problems with a verified event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid event structure: missing required fields ({0})")]
    MissingFields(String),

    #[error("Invalid event ID format: {0}")]
    MalformedId(String),

    #[error("Invalid event timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Errors surfaced by the webhook pipeline
#[derive(Error, Debug)]
pub enum StripeWebhookError {
    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Request from untrusted IP address: {0}")]
    UntrustedIp(String),

    #[error("Idempotency store error: {0}")]
    Store(String),

    #[error("No failed webhook recorded for event {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type StripeWebhookResult<T> = std::result::Result<T, StripeWebhookError>;

impl StripeWebhookError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Verification(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UntrustedIp(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller.
    ///
    /// Internal failures never leak their detail.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(_) => "Invalid event payload".to_string(),
            Self::Store(_) | Self::InternalError(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for StripeWebhookError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.public_message() });
        (self.status_code(), Json(body)).into_response()
    }
}
