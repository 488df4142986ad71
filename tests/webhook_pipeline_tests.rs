//! End-to-end tests for the webhook ingestion pipeline
//!
//! # Test Categories
//!
//! 1. **Signature Gate**: forged or stale deliveries never reach a handler
//! 2. **Idempotency**: repeated deliveries run business logic once
//! 3. **Routing**: unknown types are acknowledged
//! 4. **Retry**: exhausted retries, terminal short-circuit, audit entries
//! 5. **HTTP**: full round trip through the axum router
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --package parampara-webhooks --test webhook_pipeline_tests
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use parampara_webhooks::metrics::Metrics;
use parampara_webhooks::stripe::signature::signature_header;
use parampara_webhooks::stripe::{
    register_builtin_handlers, Downstream, EventRouter, InMemoryAuditLog,
    InMemoryIdempotencyStore, RecordingDownstream, StripeWebhookConfig, WebhookIngestService,
    WebhookResult,
};
use pretty_assertions::assert_eq;
use serde_json::json;

const SECRET: &str = "whsec_pipeline_tests";

// ============================================================================
// Fixtures
// ============================================================================

struct Harness {
    service: WebhookIngestService,
    audit: Arc<InMemoryAuditLog>,
    recorder: Arc<RecordingDownstream>,
}

fn harness_with(config: StripeWebhookConfig, extra: impl FnOnce(&EventRouter)) -> Harness {
    let recorder = Arc::new(RecordingDownstream::new());
    let router = Arc::new(EventRouter::new());
    register_builtin_handlers(&router, &Downstream::uniform(recorder.clone()));
    extra(&router);

    let audit = Arc::new(InMemoryAuditLog::new());
    let idempotency = Arc::new(InMemoryIdempotencyStore::new(
        config.idempotency_ttl,
        config.idempotency_max_entries,
    ));
    let service = WebhookIngestService::new(
        config,
        router,
        audit.clone(),
        idempotency,
        Arc::new(Metrics::new()),
    );

    Harness {
        service,
        audit,
        recorder,
    }
}

fn harness() -> Harness {
    let mut config = StripeWebhookConfig::test_config();
    config.webhook_secret = SECRET.to_string();
    harness_with(config, |_| {})
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn payment_event(id: &str, event_type: &str, created: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "type": event_type,
        "created": created,
        "livemode": false,
        "data": { "object": {
            "id": "pi_3Nx",
            "object": "payment_intent",
            "amount": 129900,
            "currency": "inr",
            "customer": "cus_42",
            "status": "succeeded",
            "metadata": { "order_id": "ord_1001" }
        } }
    }))
    .unwrap()
}

fn sign(body: &[u8]) -> String {
    signature_header(SECRET, now(), body)
}

// ============================================================================
// MODULE: Signature Gate
// ============================================================================

mod signature_gate {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_flipped_byte_is_rejected_before_handlers() {
        let h = harness();
        let body = payment_event("evt_sig_1", "payment_intent.succeeded", now());
        let header = sign(&body);

        let mut tampered = body.clone();
        let last = tampered.len() - 2;
        tampered[last] ^= 0x01;

        let result = h.service.handle_request(&tampered, Some(&header), None).await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
        assert!(!result.body.received);
        assert!(h.recorder.calls().is_empty());
        assert_eq!(h.service.metrics().rejected("signature_mismatch"), 1);
        assert_eq!(h.audit.incidents().len(), 1);
        assert_eq!(h.audit.incidents()[0].kind, "signature_mismatch");
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let h = harness();
        let body = payment_event("evt_sig_2", "payment_intent.succeeded", now());
        let header = signature_header("whsec_someone_else", now(), &body);

        let result = h.service.handle_request(&body, Some(&header), None).await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
        assert!(h.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_replayed_event_is_rejected() {
        let h = harness();
        let tolerance = h.service.config().security.tolerance_window;
        let body = payment_event(
            "evt_replay",
            "payment_intent.succeeded",
            now() - tolerance - 1,
        );

        // Fresh, valid signature over an old event
        let result = h.service.handle_request(&body, Some(&sign(&body)), None).await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
        assert!(h.recorder.calls().is_empty());
        assert_eq!(h.service.metrics().rejected("stale_timestamp"), 1);
    }

    #[tokio::test]
    async fn test_stale_signature_timestamp_is_rejected() {
        let h = harness();
        let body = payment_event("evt_old_sig", "payment_intent.succeeded", now());
        let header = signature_header(SECRET, now() - 3600, &body);

        let result = h.service.handle_request(&body, Some(&header), None).await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
        assert!(h.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_garbled_header_is_rejected() {
        let h = harness();
        let body = payment_event("evt_garbled", "payment_intent.succeeded", now());

        let result = h
            .service
            .handle_request(&body, Some("not-a-signature"), None)
            .await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
        assert_eq!(h.service.metrics().rejected("invalid_signature_format"), 1);
    }
}

// ============================================================================
// MODULE: Idempotency
// ============================================================================

mod idempotency {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_same_event_twice_runs_once() {
        let h = harness();
        let body = payment_event("evt_idem", "payment_intent.succeeded", now());

        let first = h.service.handle_request(&body, Some(&sign(&body)), None).await;
        let second = h.service.handle_request(&body, Some(&sign(&body)), None).await;

        assert_eq!(first.body.processed, Some(true));
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.body.duplicate, Some(true));
        assert_eq!(second.body.processed, None);
        assert_eq!(h.recorder.count("order_paid"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_run_once() {
        let h = Arc::new(harness());
        let body = Arc::new(payment_event("evt_race", "payment_intent.succeeded", now()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let h = h.clone();
                let body = body.clone();
                tokio::spawn(async move {
                    let header = sign(&body);
                    h.service.handle_request(&body, Some(&header), None).await
                })
            })
            .collect();

        let mut duplicates = 0;
        for task in tasks {
            let result = task.await.unwrap();
            assert_eq!(result.status, StatusCode::OK);
            if result.body.duplicate == Some(true) {
                duplicates += 1;
            }
        }

        assert_eq!(duplicates, 7);
        assert_eq!(h.recorder.count("order_paid"), 1);
    }
}

// ============================================================================
// MODULE: Routing
// ============================================================================

mod routing {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_unknown_event_type_is_acknowledged() {
        let h = harness();
        let body = payment_event("evt_unknown", "foo.bar", now());

        let result = h.service.handle_request(&body, Some(&sign(&body)), None).await;
        assert_eq!(result.status, StatusCode::OK);
        assert_eq!(result.body.processed, Some(true));
        assert_eq!(result.body.error.as_deref(), Some("no handler for foo.bar"));
        assert!(h.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_payment_succeeded() {
        let h = harness();
        let body = payment_event("evt_1", "payment_intent.succeeded", now());

        let result = h.service.handle_request(&body, Some(&sign(&body)), None).await;
        assert_eq!(result.status, StatusCode::OK);
        assert!(result.body.received);
        assert_eq!(result.body.processed, Some(true));
        assert_eq!(result.body.error, None);
        assert_eq!(
            h.recorder.actions(),
            vec![
                "order_paid",
                "payment_confirmation",
                "update_inventory",
                "create_shipping_order"
            ]
        );

        let entry = h.audit.entry("evt_1").unwrap();
        assert!(entry.success);
        assert_eq!(entry.attempts, 1);
    }
}

// ============================================================================
// MODULE: Retry
// ============================================================================

mod retry {
    use super::*;
    use pretty_assertions::assert_eq;

    fn counting_harness(result: WebhookResult, calls: Arc<AtomicUsize>) -> Harness {
        let mut config = StripeWebhookConfig::new(SECRET);
        config.idempotency_max_entries = 100;
        harness_with(config, move |router| {
            router.register_fn("payment_intent.succeeded", move |_event| {
                let calls = calls.clone();
                let result = result.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    result
                }
            });
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_with_default_config() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = counting_harness(WebhookResult::retryable("warehouse unavailable"), calls.clone());
        let body = payment_event("evt_exhausted", "payment_intent.succeeded", now());

        let started = tokio::time::Instant::now();
        let result = h.service.handle_request(&body, Some(&sign(&body)), None).await;

        assert_eq!(result.status, StatusCode::OK);
        assert!(result.body.received);
        assert_eq!(result.body.processed, Some(false));
        assert_eq!(result.body.retryable, Some(false));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // 1000ms + 2000ms of backoff between the three attempts
        assert!(started.elapsed() >= std::time::Duration::from_millis(3000));

        assert_eq!(h.audit.len(), 1);
        let entry = h.audit.entry("evt_exhausted").unwrap();
        assert_eq!(entry.attempts, 3);
        assert!(!entry.success);
        assert_eq!(entry.error.as_deref(), Some("warehouse unavailable"));

        assert_eq!(h.service.dead_letter_ids(), vec!["evt_exhausted".to_string()]);
        let failed = h.service.failed_webhooks(10).await.unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = counting_harness(WebhookResult::terminal("order does not exist"), calls.clone());
        let body = payment_event("evt_terminal", "payment_intent.succeeded", now());

        let result = h.service.handle_request(&body, Some(&sign(&body)), None).await;

        assert_eq!(result.status, StatusCode::OK);
        assert_eq!(result.body.processed, Some(false));
        assert_eq!(result.body.retryable, Some(false));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.audit.entry("evt_terminal").unwrap().attempts, 1);
    }

    fn explode() -> WebhookResult {
        panic!("handler blew up")
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let h = harness_with(StripeWebhookConfig::new(SECRET), move |router| {
            router.register_fn("payment_intent.succeeded", move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    explode()
                }
            });
        });
        let body = payment_event("evt_panic", "payment_intent.succeeded", now());

        let result = h.service.handle_request(&body, Some(&sign(&body)), None).await;

        assert_eq!(result.status, StatusCode::OK);
        assert_eq!(result.body.processed, Some(false));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.audit.entry("evt_panic").unwrap().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_downstream_recovers_within_retry_budget() {
        let h = harness();
        h.recorder.fail_times("create_shipping_order", 2);
        let body = payment_event("evt_flaky", "payment_intent.succeeded", now());

        let result = h.service.handle_request(&body, Some(&sign(&body)), None).await;

        assert_eq!(result.body.processed, Some(true));
        assert_eq!(h.audit.entry("evt_flaky").unwrap().attempts, 3);
        assert!(h.service.dead_letter_ids().is_empty());

        let stats = h.service.health().await.unwrap().retry_stats;
        assert_eq!(stats.total_webhooks, 1);
        assert_eq!(stats.successful_webhooks, 1);
    }
}

// ============================================================================
// MODULE: HTTP
// ============================================================================

mod http_layer {
    use super::*;
    use pretty_assertions::assert_eq;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use parampara_webhooks::stripe::stripe_webhook_router;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_http_round_trip() {
        let h = harness();
        let service = Arc::new(h.service);
        let body = payment_event("evt_http", "payment_intent.succeeded", now());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/webhooks/stripe")
            .header("content-type", "application/json")
            .header("stripe-signature", sign(&body))
            .header("x-forwarded-for", "3.18.12.63")
            .body(Body::from(body))
            .unwrap();

        let response = stripe_webhook_router(service.clone())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, json!({ "received": true, "processed": true }));

        let metrics = stripe_webhook_router(service)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(metrics.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("stripe_webhooks_processed_total 1"));
    }
}
