// Allow missing docs in this module - handler internals are documented per type
#![allow(missing_docs)]

//! Stripe Webhook Ingestion Module
//!
//! Receives Stripe webhook deliveries, authenticates them, suppresses
//! duplicates and routes each event to business logic with bounded retries.
//!
//! - **Signature Verification**: HMAC-SHA256 over `"{t}." + raw body`, constant-time compare
//! - **Replay Protection**: header timestamp and event `created` inside the tolerance window
//! - **Idempotency**: atomic claim on the event ID before any handler runs
//! - **Routing**: event type string to a registered [`EventHandler`]
//! - **Retry**: exponential backoff, one audit log entry per terminal outcome
//!
//! # Architecture
//!
//! ```text
//! Request -> IP allow-list -> Signature -> Validate -> Claim -> Route + Retry -> Mark
//!                 |               |            |          |            |
//!                 v               v            v          v            v
//!                403             400          400    200 (dup)   200 (failures kept for manual retry)
//! ```
//!
//! # Security
//!
//! - Signing secret loaded from `STRIPE_WEBHOOK_SECRET`
//! - JSON is parsed only after the MAC check passes
//! - Rejections are recorded as security incidents with sanitized detail
//!
//! # Example
//!
//! ```rust,no_run
//! use parampara_webhooks::stripe::{
//!     stripe_webhook_router, Downstream, StripeWebhookConfig, WebhookIngestService,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StripeWebhookConfig::from_env()?;
//!     let service = WebhookIngestService::in_memory(config, &Downstream::logging());
//!
//!     let app = stripe_webhook_router(Arc::new(service));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3001").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod handlers;
pub mod idempotency;
pub mod retry;
pub mod router;
pub mod security;
pub mod service;
pub mod signature;
pub mod validator;

// Re-export commonly used items
pub use audit::{AuditSink, InMemoryAuditLog, RetryStats, WebhookLogEntry};
pub use config::{SecurityConfig, StripeWebhookConfig};
pub use error::{StripeWebhookError, StripeWebhookResult, ValidationError, VerificationError};
pub use events::{
    Invoice, PaymentIntent, StripeEventType, Subscription, SubscriptionStatus, WebhookEvent,
};
pub use handler::{stripe_webhook_handler, stripe_webhook_router};
pub use handlers::{
    register_builtin_handlers, Downstream, InvoiceEventHandler, LoggingDownstream,
    PaymentEventHandler, RecordingDownstream, SubscriptionEventHandler,
};
pub use idempotency::{IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore, ProcessingState};
pub use retry::{RetryConfig, RetryExecutor, WebhookResult};
pub use router::{EventHandler, EventRouter};
pub use security::{IpAllowList, SecurityIncident};
pub use service::{HealthReport, HttpResult, WebhookIngestService, WebhookResponse};
pub use signature::{SignatureHeader, SignatureVerifier};
pub use validator::EventValidator;
