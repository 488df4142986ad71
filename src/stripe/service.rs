//! Webhook Ingest Service
//!
//! Orchestrates one inbound delivery end to end:
//!
//! ```text
//! header present? -> IP allowed? -> signature -> validate -> claim ID
//!     -> RetryExecutor(EventRouter::dispatch) -> mark ID -> 200
//! ```
//!
//! Every processed delivery is answered with 200, including business
//! failures, so the provider does not redeliver an event this service has
//! already given up on. Failed events are kept as dead letters for manual
//! retry.
//!
//! Claim-to-mark runs on its own task. A request that is dropped mid-backoff
//! (client disconnect, server timeout) does not strand the claimed ID.

use std::collections::HashMap;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use futures::FutureExt;
use http::StatusCode;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::metrics::Metrics;
use crate::stripe::audit::{AuditSink, InMemoryAuditLog, RetryStats, WebhookLogEntry};
use crate::stripe::config::StripeWebhookConfig;
use crate::stripe::error::{StripeWebhookError, StripeWebhookResult, VerificationError};
use crate::stripe::events::WebhookEvent;
use crate::stripe::handlers::{register_builtin_handlers, Downstream};
use crate::stripe::idempotency::{IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore};
use crate::stripe::retry::{panic_message, RetryExecutor, WebhookResult};
use crate::stripe::router::EventRouter;
use crate::stripe::security::{sanitize_event_for_logging, IpAllowList, SecurityIncident};
use crate::stripe::signature::SignatureVerifier;
use crate::stripe::validator::EventValidator;

/// Default page size for failed-webhook queries
pub const DEFAULT_FAILED_LIMIT: usize = 100;

/// Body of every webhook endpoint response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub received: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl WebhookResponse {
    fn duplicate() -> Self {
        Self {
            received: true,
            duplicate: Some(true),
            ..Default::default()
        }
    }

    fn processed(result: &WebhookResult) -> Self {
        Self {
            received: true,
            processed: Some(result.success),
            duplicate: None,
            error: result.error.clone(),
            retryable: if result.success { None } else { result.retryable },
        }
    }

    fn rejected(error: String) -> Self {
        Self {
            received: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// HTTP-facing outcome of one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResult {
    pub status: StatusCode,
    pub body: WebhookResponse,
}

impl HttpResult {
    fn ok(body: WebhookResponse) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    fn from_error(err: &StripeWebhookError) -> Self {
        Self {
            status: err.status_code(),
            body: WebhookResponse::rejected(err.public_message()),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: WebhookResponse::rejected("Internal server error".to_string()),
        }
    }
}

impl IntoResponse for HttpResult {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Health summary for the management API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub handlers_count: usize,
    pub supported_events: Vec<String>,
    pub retry_stats: RetryStats,
}

#[derive(Debug, Clone)]
struct DeadLetter {
    event: WebhookEvent,
    stored: Instant,
}

/// Failed events held for manual retry, bounded by age and count
#[derive(Debug)]
struct DeadLetterQueue {
    ttl: Duration,
    max_entries: usize,
    letters: RwLock<HashMap<String, DeadLetter>>,
}

impl DeadLetterQueue {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            letters: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, event: &WebhookEvent) {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut letters = self.letters.write();
        letters.retain(|_, l| now.duration_since(l.stored) < ttl);

        if !letters.contains_key(&event.id) {
            while letters.len() >= self.max_entries {
                let oldest = letters
                    .iter()
                    .min_by_key(|(_, l)| l.stored)
                    .map(|(id, _)| id.clone());
                match oldest {
                    Some(id) => {
                        tracing::warn!(event_id = %id, "Evicting dead letter");
                        letters.remove(&id);
                    }
                    None => break,
                }
            }
        }

        letters.insert(
            event.id.clone(),
            DeadLetter {
                event: event.clone(),
                stored: now,
            },
        );
    }

    fn get(&self, event_id: &str) -> Option<WebhookEvent> {
        let now = Instant::now();
        self.letters
            .read()
            .get(event_id)
            .filter(|l| now.duration_since(l.stored) < self.ttl)
            .map(|l| l.event.clone())
    }

    fn remove(&self, event_id: &str) {
        self.letters.write().remove(event_id);
    }

    fn ids(&self) -> Vec<String> {
        let now = Instant::now();
        let mut ids: Vec<String> = self
            .letters
            .read()
            .iter()
            .filter(|(_, l)| now.duration_since(l.stored) < self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Claim-independent half of the pipeline: route, retry, record, mark.
///
/// Shared with spawned tasks, so it owns everything it touches.
struct EventProcessor {
    guard: IdempotencyGuard,
    router: Arc<EventRouter>,
    executor: RetryExecutor,
    metrics: Arc<Metrics>,
    dead_letters: DeadLetterQueue,
}

impl EventProcessor {
    async fn run(&self, event: &WebhookEvent) -> WebhookResult {
        let started = Instant::now();
        let result = self
            .executor
            .execute_with_retry(&event.id, &event.event_type, || self.router.dispatch(event))
            .await;
        let elapsed = started.elapsed();

        if result.success {
            self.metrics.record_processed(elapsed);
            self.dead_letters.remove(&event.id);
            if let Err(e) = self.guard.mark_processed(&event.id).await {
                tracing::error!(event_id = %event.id, error = %e, "Failed to mark event processed");
            }
        } else {
            self.metrics.record_failed(elapsed);
            self.dead_letters.insert(event);
            if let Err(e) = self.guard.mark_failed(&event.id).await {
                tracing::error!(event_id = %event.id, error = %e, "Failed to mark event failed");
            }
        }

        result
    }

    /// Run `event` on a detached task and wait for it
    async fn run_detached(self: &Arc<Self>, event: &WebhookEvent) -> StripeWebhookResult<WebhookResult> {
        let processor = Arc::clone(self);
        let event = event.clone();
        let event_id = event.id.clone();

        tokio::spawn(async move { processor.run(&event).await })
            .await
            .map_err(|e| {
                tracing::error!(event_id = %event_id, error = %e, "Webhook processing task failed");
                StripeWebhookError::InternalError(format!("processing task failed: {}", e))
            })
    }
}

/// End-to-end webhook processing
pub struct WebhookIngestService {
    config: Arc<StripeWebhookConfig>,
    verifier: SignatureVerifier,
    validator: EventValidator,
    ip_filter: IpAllowList,
    processor: Arc<EventProcessor>,
    audit: Arc<dyn AuditSink>,
}

impl WebhookIngestService {
    pub fn new(
        config: StripeWebhookConfig,
        router: Arc<EventRouter>,
        audit: Arc<dyn AuditSink>,
        idempotency: Arc<dyn IdempotencyStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let verifier = SignatureVerifier::from_config(&config, audit.clone());
        let ip_filter = IpAllowList::from_config(&config.security);
        let processor = EventProcessor {
            guard: IdempotencyGuard::new(idempotency),
            router,
            executor: RetryExecutor::new(config.retry.clone(), audit.clone()),
            metrics,
            dead_letters: DeadLetterQueue::new(config.dead_letter_ttl, config.dead_letter_max_entries),
        };

        Self {
            config: Arc::new(config),
            verifier,
            validator: EventValidator::new(),
            ip_filter,
            processor: Arc::new(processor),
            audit,
        }
    }

    /// Build a service with in-memory stores and the built-in handlers
    pub fn in_memory(config: StripeWebhookConfig, downstream: &Downstream) -> Self {
        let router = Arc::new(EventRouter::new());
        register_builtin_handlers(&router, downstream);

        let idempotency = Arc::new(InMemoryIdempotencyStore::new(
            config.idempotency_ttl,
            config.idempotency_max_entries,
        ));

        Self::new(
            config,
            router,
            Arc::new(InMemoryAuditLog::new()),
            idempotency,
            Arc::new(Metrics::new()),
        )
    }

    pub fn config(&self) -> &StripeWebhookConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.processor.router
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.processor.metrics
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Handle one inbound delivery. Never panics; unexpected failures map to 500.
    pub async fn handle_request(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        source_ip: Option<IpAddr>,
    ) -> HttpResult {
        self.metrics().record_received();

        match AssertUnwindSafe(self.process(raw_body, signature, source_ip))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                if err.status_code().is_server_error() {
                    self.metrics().record_internal_error();
                    tracing::error!(error = %err, "Webhook processing error");
                }
                HttpResult::from_error(&err)
            }
            Err(panic) => {
                self.metrics().record_internal_error();
                tracing::error!(
                    error = %panic_message(panic.as_ref()),
                    source_ip = ?source_ip,
                    "Webhook processing panicked"
                );
                HttpResult::internal()
            }
        }
    }

    async fn process(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        source_ip: Option<IpAddr>,
    ) -> StripeWebhookResult<HttpResult> {
        if signature.map_or(true, |s| s.trim().is_empty()) {
            let err = VerificationError::MissingSignature;
            self.reject(err.kind(), &err.to_string(), source_ip).await;
            return Err(err.into());
        }

        if !self.ip_filter.is_allowed(source_ip) {
            let ip = source_ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
            tracing::warn!(source_ip = %ip, "Webhook request from untrusted IP");
            self.reject("untrusted_ip", &format!("untrusted source {}", ip), source_ip)
                .await;
            return Err(StripeWebhookError::UntrustedIp(ip));
        }

        // The verifier records its own incident on failure
        let event = self
            .verifier
            .verify(raw_body, signature, source_ip)
            .await
            .map_err(|err| {
                self.metrics().record_rejected(err.kind());
                err
            })?;

        if let Err(err) = self.validator.validate(&event) {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %err,
                "Webhook event failed validation"
            );
            self.metrics().record_rejected("validation");
            return Err(err.into());
        }

        if self.config.log_payloads {
            tracing::debug!(
                event_id = %event.id,
                payload = %String::from_utf8_lossy(raw_body),
                "Webhook payload"
            );
        } else {
            tracing::debug!(event = %sanitize_event_for_logging(&event), "Webhook event");
        }

        if !self.processor.guard.claim(&event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, skipping"
            );
            self.metrics().record_duplicate();
            return Ok(HttpResult::ok(WebhookResponse::duplicate()));
        }

        let result = self.processor.run_detached(&event).await?;
        Ok(HttpResult::ok(WebhookResponse::processed(&result)))
    }

    async fn reject(&self, kind: &str, error: &str, source_ip: Option<IpAddr>) {
        self.metrics().record_rejected(kind);
        let incident = SecurityIncident::new(kind, error, source_ip);
        if let Err(e) = self.audit.record_incident(incident).await {
            tracing::error!(error = %e, "Failed to record security incident");
        }
    }

    /// Re-run a failed event, bypassing the idempotency guard
    pub async fn manual_retry(&self, event_id: &str) -> StripeWebhookResult<WebhookResult> {
        let event = self
            .processor
            .dead_letters
            .get(event_id)
            .ok_or_else(|| StripeWebhookError::NotFound(event_id.to_string()))?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Manual webhook retry"
        );
        self.metrics().record_manual_retry();

        self.processor.run_detached(&event).await
    }

    /// IDs currently held for manual retry, sorted
    pub fn dead_letter_ids(&self) -> Vec<String> {
        self.processor.dead_letters.ids()
    }

    pub fn supported_events(&self) -> Vec<String> {
        self.router().supported_event_types()
    }

    pub async fn failed_webhooks(&self, limit: usize) -> StripeWebhookResult<Vec<WebhookLogEntry>> {
        self.audit
            .failed_entries(limit)
            .await
            .map_err(|e| StripeWebhookError::InternalError(format!("{:#}", e)))
    }

    pub async fn health(&self) -> StripeWebhookResult<HealthReport> {
        let retry_stats = self
            .audit
            .retry_stats()
            .await
            .map_err(|e| StripeWebhookError::InternalError(format!("{:#}", e)))?;

        Ok(HealthReport {
            status: "healthy",
            handlers_count: self.router().handler_count(),
            supported_events: self.router().supported_event_types(),
            retry_stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stripe::handlers::RecordingDownstream;
    use crate::stripe::signature::signature_header;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(id: &str, event_type: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": id,
            "type": event_type,
            "created": chrono::Utc::now().timestamp(),
            "livemode": false,
            "data": { "object": {
                "id": "in_1",
                "object": "invoice",
                "customer": "cus_1",
                "subscription": "sub_1",
                "amount_due": 1000,
                "amount_paid": 1000
            } }
        }))
        .unwrap()
    }

    fn sign(config: &StripeWebhookConfig, body: &[u8]) -> String {
        signature_header(&config.webhook_secret, chrono::Utc::now().timestamp(), body)
    }

    fn service() -> (WebhookIngestService, Arc<RecordingDownstream>) {
        let recorder = Arc::new(RecordingDownstream::new());
        let service = WebhookIngestService::in_memory(
            StripeWebhookConfig::test_config(),
            &Downstream::uniform(recorder.clone()),
        );
        (service, recorder)
    }

    #[tokio::test]
    async fn test_processed() {
        let (service, recorder) = service();
        let body = payload("evt_ok", "invoice.paid");
        let sig = sign(service.config(), &body);

        let result = service.handle_request(&body, Some(&sig), None).await;
        assert_eq!(result.status, StatusCode::OK);
        assert_eq!(result.body.processed, Some(true));
        assert_eq!(recorder.count("record_invoice_payment"), 1);
        assert!(service.dead_letter_ids().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_skips_handlers() {
        let (service, recorder) = service();
        let body = payload("evt_dup", "invoice.paid");
        let sig = sign(service.config(), &body);

        service.handle_request(&body, Some(&sig), None).await;
        let second = service.handle_request(&body, Some(&sig), None).await;

        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.body, WebhookResponse::duplicate());
        assert_eq!(recorder.count("record_invoice_payment"), 1);
        assert_eq!(service.metrics().snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn test_missing_signature_records_incident() {
        let (service, recorder) = service();
        let body = payload("evt_nosig", "invoice.paid");

        let result = service.handle_request(&body, None, None).await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
        assert!(!result.body.received);
        assert!(recorder.calls().is_empty());
        assert_eq!(service.metrics().rejected("missing_signature"), 1);
    }

    #[tokio::test]
    async fn test_untrusted_ip() {
        let recorder = Arc::new(RecordingDownstream::new());
        let mut config = StripeWebhookConfig::test_config();
        config.security.enable_ip_validation = true;
        config
            .security
            .trusted_ips
            .insert("3.18.12.63".parse().unwrap());
        let service = WebhookIngestService::in_memory(config, &Downstream::uniform(recorder.clone()));

        let body = payload("evt_ip", "invoice.paid");
        let sig = sign(service.config(), &body);

        let denied = service
            .handle_request(&body, Some(&sig), Some("203.0.113.5".parse().unwrap()))
            .await;
        assert_eq!(denied.status, StatusCode::FORBIDDEN);

        let unknown = service.handle_request(&body, Some(&sig), None).await;
        assert_eq!(unknown.status, StatusCode::FORBIDDEN);

        let allowed = service
            .handle_request(&body, Some(&sig), Some("3.18.12.63".parse().unwrap()))
            .await;
        assert_eq!(allowed.status, StatusCode::OK);
        assert_eq!(recorder.count("record_invoice_payment"), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_is_400() {
        let (service, _) = service();
        let body = payload("not_an_event_id", "invoice.paid");
        let sig = sign(service.config(), &body);

        let result = service.handle_request(&body, Some(&sig), None).await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
        assert_eq!(result.body.error.as_deref(), Some("Invalid event payload"));
        assert_eq!(service.metrics().rejected("validation"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_manual_retry() {
        let (service, recorder) = service();
        recorder.fail_times("record_invoice_payment", 3);
        let body = payload("evt_retry", "invoice.paid");
        let sig = sign(service.config(), &body);

        let result = service.handle_request(&body, Some(&sig), None).await;
        assert_eq!(result.status, StatusCode::OK);
        assert_eq!(result.body.processed, Some(false));
        assert_eq!(result.body.retryable, Some(false));
        assert_eq!(service.dead_letter_ids(), vec!["evt_retry".to_string()]);

        let retried = service.manual_retry("evt_retry").await.unwrap();
        assert!(retried.success);
        assert!(service.dead_letter_ids().is_empty());

        // Now completed: a redelivery is a duplicate
        let again = service.handle_request(&body, Some(&sig), None).await;
        assert_eq!(again.body.duplicate, Some(true));
    }

    #[tokio::test]
    async fn test_manual_retry_unknown_id() {
        let (service, _) = service();
        assert!(matches!(
            service.manual_retry("evt_missing").await,
            Err(StripeWebhookError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_still_completes_processing() {
        let (service, recorder) = service();
        recorder.fail_times("invoice_receipt", 1);
        let body = payload("evt_dropped", "invoice.paid");
        let sig = sign(service.config(), &body);

        // Gives up during the 10ms backoff after the first failed attempt
        let dropped = tokio::time::timeout(
            Duration::from_millis(5),
            service.handle_request(&body, Some(&sig), None),
        )
        .await;
        assert!(dropped.is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(recorder.count("invoice_receipt"), 2);
        assert!(service.dead_letter_ids().is_empty());
        let stats = service.health().await.unwrap().retry_stats;
        assert_eq!(stats.total_webhooks, 1);
        assert_eq!(stats.successful_webhooks, 1);
        assert!((stats.average_attempts - 2.0).abs() < f64::EPSILON);

        let redelivery = service.handle_request(&body, Some(&sig), None).await;
        assert_eq!(redelivery.body, WebhookResponse::duplicate());
        assert_eq!(recorder.count("record_invoice_payment"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_failing_request_leaves_dead_letter() {
        let (service, recorder) = service();
        recorder.fail_always("record_invoice_payment");
        let body = payload("evt_dropped_fail", "invoice.paid");
        let sig = sign(service.config(), &body);

        let dropped = tokio::time::timeout(
            Duration::from_millis(5),
            service.handle_request(&body, Some(&sig), None),
        )
        .await;
        assert!(dropped.is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.count("record_invoice_payment"), 3);
        assert_eq!(service.dead_letter_ids(), vec!["evt_dropped_fail".to_string()]);

        // Marked failed, so a redelivery is processed again
        let redelivery = service.handle_request(&body, Some(&sig), None).await;
        assert_eq!(redelivery.body.duplicate, None);
        assert_eq!(redelivery.body.processed, Some(false));
        assert_eq!(recorder.count("record_invoice_payment"), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letters_are_bounded() {
        let recorder = Arc::new(RecordingDownstream::new());
        recorder.fail_always("record_invoice_payment");
        let mut config = StripeWebhookConfig::test_config();
        config.dead_letter_max_entries = 2;
        config.dead_letter_ttl = Duration::from_secs(60);
        let service = WebhookIngestService::in_memory(config, &Downstream::uniform(recorder));

        for id in ["evt_dl_a", "evt_dl_b", "evt_dl_c"] {
            let body = payload(id, "invoice.paid");
            let sig = sign(service.config(), &body);
            let result = service.handle_request(&body, Some(&sig), None).await;
            assert_eq!(result.body.processed, Some(false));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        assert_eq!(
            service.dead_letter_ids(),
            vec!["evt_dl_b".to_string(), "evt_dl_c".to_string()]
        );
        assert!(matches!(
            service.manual_retry("evt_dl_a").await,
            Err(StripeWebhookError::NotFound(_))
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(service.dead_letter_ids().is_empty());
        assert!(matches!(
            service.manual_retry("evt_dl_c").await,
            Err(StripeWebhookError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_created_is_a_validation_failure() {
        let (service, recorder) = service();
        let mut value: serde_json::Value =
            serde_json::from_slice(&payload("evt_zero_created", "invoice.paid")).unwrap();
        value["created"] = json!(0);
        let body = serde_json::to_vec(&value).unwrap();
        let sig = sign(service.config(), &body);

        let result = service.handle_request(&body, Some(&sig), None).await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
        assert_eq!(service.metrics().rejected("validation"), 1);
        assert_eq!(service.metrics().rejected("stale_timestamp"), 0);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let (service, _) = service();
        let health = service.health().await.unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.handlers_count, 8);
        assert_eq!(health.retry_stats.total_webhooks, 0);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["handlers_count"], 8);
        assert_eq!(json["retry_stats"]["total_webhooks"], 0);
        assert!(json["retry_stats"].get("totalWebhooks").is_none());
    }
}
