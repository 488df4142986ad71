//! Axum Handler and Router for Stripe Webhooks
//!
//! HTTP layer over [`WebhookIngestService`]. The webhook body is taken as raw
//! bytes so the signature is checked against exactly what Stripe sent.
//!
//! # Endpoints
//!
//! - `POST /api/webhooks/stripe` - webhook receiver
//! - `GET  /api/webhooks/health` - handler count, supported events, retry stats
//! - `GET  /api/webhooks/events` - supported event types
//! - `GET  /api/webhooks/failed?limit=N` - failed log entries, newest first
//! - `POST /api/webhooks/retry/:event_id` - manual retry of a failed event
//! - `GET  /metrics` - Prometheus text

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::stripe::retry::WebhookResult;
use crate::stripe::service::{WebhookIngestService, DEFAULT_FAILED_LIMIT};

/// Create the webhook router
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use parampara_webhooks::stripe::{
///     stripe_webhook_router, Downstream, StripeWebhookConfig, WebhookIngestService,
/// };
///
/// let config = StripeWebhookConfig::from_env().expect("config");
/// let service = WebhookIngestService::in_memory(config, &Downstream::logging());
/// let app = stripe_webhook_router(Arc::new(service));
/// ```
pub fn stripe_webhook_router(service: Arc<WebhookIngestService>) -> Router {
    Router::new()
        .route("/api/webhooks/stripe", post(stripe_webhook_handler))
        .route("/api/webhooks/health", get(webhook_health))
        .route("/api/webhooks/events", get(supported_events))
        .route("/api/webhooks/failed", get(failed_webhooks))
        .route("/api/webhooks/retry/:event_id", post(retry_webhook))
        .route("/metrics", get(metrics_handler))
        .with_state(service)
}

/// Webhook receiver
pub async fn stripe_webhook_handler(
    State(service): State<Arc<WebhookIngestService>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Non-UTF-8 bytes become U+FFFD and fail header parsing inside the service
    let signature = headers
        .get(service.config().signature_header.as_str())
        .map(|value| String::from_utf8_lossy(value.as_bytes()));

    let source_ip = source_ip(connect_info.map(|ConnectInfo(addr)| addr), &headers);

    service
        .handle_request(&body, signature.as_deref(), source_ip)
        .await
        .into_response()
}

/// Peer address, falling back to the first `x-forwarded-for` hop
fn source_ip(peer: Option<SocketAddr>, headers: &HeaderMap) -> Option<IpAddr> {
    peer.map(|addr| addr.ip()).or_else(|| {
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse().ok())
    })
}

pub async fn webhook_health(State(service): State<Arc<WebhookIngestService>>) -> Response {
    match service.health().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Webhook health check failed");
            e.into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct SupportedEvents {
    events: Vec<String>,
}

pub async fn supported_events(State(service): State<Arc<WebhookIngestService>>) -> impl IntoResponse {
    Json(SupportedEvents {
        events: service.supported_events(),
    })
}

#[derive(Debug, Deserialize)]
pub struct FailedQuery {
    limit: Option<usize>,
}

pub async fn failed_webhooks(
    State(service): State<Arc<WebhookIngestService>>,
    Query(query): Query<FailedQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_FAILED_LIMIT);
    match service.failed_webhooks(limit).await {
        Ok(entries) => Json(serde_json::json!({ "failed": entries })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    event_id: String,
    #[serde(flatten)]
    result: WebhookResult,
}

pub async fn retry_webhook(
    State(service): State<Arc<WebhookIngestService>>,
    Path(event_id): Path<String>,
) -> Response {
    match service.manual_retry(&event_id).await {
        Ok(result) => Json(RetryResponse { event_id, result }).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn metrics_handler(State(service): State<Arc<WebhookIngestService>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.metrics().to_prometheus_format(),
    )
}
