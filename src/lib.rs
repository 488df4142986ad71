//! Parampara Webhooks - Stripe Webhook Ingestion & Retry Service
//!
//! This crate receives Stripe webhook deliveries over HTTP, verifies them,
//! processes each event at most once per process, and retries transient
//! downstream failures with exponential backoff.
//!
//! # Features
//!
//! - **Signature Verification**: HMAC-SHA256 with replay window
//! - **Idempotency**: Duplicate deliveries acknowledged without reprocessing
//! - **Event Routing**: Payment, subscription and invoice handlers, plus custom ones
//! - **Retry & Audit**: Bounded backoff, per-event log entries, manual retry of failures
//! - **Metrics**: Prometheus text export with latency percentiles
//!
//! # Architecture
//!
//! ```text
//! Stripe ──▶ Axum Router ──▶ WebhookIngestService
//!                                   │
//!           ┌───────────────┬───────┴───────┬────────────────┐
//!           ▼               ▼               ▼                ▼
//!    SignatureVerifier  EventValidator  IdempotencyGuard  RetryExecutor
//!                                                            │
//!                                                            ▼
//!                                                       EventRouter
//!                                                            │
//!                                          ┌─────────────────┼───────────────┐
//!                                          ▼                 ▼               ▼
//!                                       Payment        Subscription       Invoice
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use parampara_webhooks::stripe::{
//!     stripe_webhook_router, Downstream, StripeWebhookConfig, WebhookIngestService,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StripeWebhookConfig::from_env()?;
//!     let service = WebhookIngestService::in_memory(config, &Downstream::logging());
//!
//!     let app = stripe_webhook_router(Arc::new(service));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3001").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod metrics;
pub mod stripe;

// Re-exports for convenience
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use stripe::{
    stripe_webhook_router, EventRouter, StripeWebhookConfig, WebhookIngestService,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
