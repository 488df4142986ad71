//! Metrics Collection for Webhook Ingestion
//!
//! This module provides:
//! - Atomic counters for received, processed, failed and duplicate deliveries
//! - Rejections broken down by reason (signature, IP, validation)
//! - An HdrHistogram of processing latency for p50/p95/p99
//! - Prometheus-compatible text format export
//!
//! # Example
//!
//! ```rust
//! use parampara_webhooks::metrics::Metrics;
//! use std::time::Duration;
//!
//! let metrics = Metrics::new();
//! metrics.record_received();
//! metrics.record_processed(Duration::from_millis(12));
//!
//! let output = metrics.to_prometheus_format();
//! assert!(output.contains("stripe_webhooks_processed_total 1"));
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::Serialize;

/// Metric name prefix
const PREFIX: &str = "stripe_webhooks";

// ============================================================================
// Latency Histogram
// ============================================================================

/// Thread-safe latency histogram using HdrHistogram.
///
/// Tracks latencies from 1us to 10 minutes with 3 significant figures, which
/// covers the longest retry sequence the executor allows.
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: RwLock<Histogram<u64>>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let histogram =
            Histogram::new_with_bounds(1, 600_000_000, 3).expect("static histogram bounds");
        Self {
            inner: RwLock::new(histogram),
        }
    }

    /// Record a latency duration. Values above the bound are clamped.
    pub fn record_duration(&self, duration: Duration) {
        let micros = (duration.as_micros() as u64).max(1);
        // saturating_record clamps out-of-range values instead of failing
        self.inner.write().saturating_record(micros);
    }

    /// Value at `percentile` (0.0 - 100.0) in microseconds, 0 if empty
    pub fn percentile(&self, percentile: f64) -> u64 {
        self.inner.read().value_at_percentile(percentile)
    }

    pub fn count(&self) -> u64 {
        self.inner.read().len()
    }

    /// Summary in milliseconds
    pub fn summary(&self) -> LatencySummary {
        let hist = self.inner.read();
        let ms = |us: u64| us as f64 / 1000.0;
        LatencySummary {
            count: hist.len(),
            p50_ms: ms(hist.value_at_percentile(50.0)),
            p95_ms: ms(hist.value_at_percentile(95.0)),
            p99_ms: ms(hist.value_at_percentile(99.0)),
            max_ms: ms(hist.max()),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

// ============================================================================
// Metrics
// ============================================================================

/// Webhook pipeline metrics, shared via `Arc`
#[derive(Debug)]
pub struct Metrics {
    /// Deliveries that reached the endpoint
    pub received_total: AtomicU64,
    /// Events whose handler sequence succeeded
    pub processed_total: AtomicU64,
    /// Events whose handler sequence ended in failure
    pub failed_total: AtomicU64,
    /// Deliveries suppressed as duplicates
    pub duplicates_total: AtomicU64,
    /// Manual retries requested through the management API
    pub manual_retries_total: AtomicU64,
    /// 500 responses
    pub internal_errors_total: AtomicU64,

    rejected_by_reason: RwLock<BTreeMap<String, u64>>,
    processing_latency: LatencyHistogram,
    start_time: Instant,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub manual_retries: u64,
    pub internal_errors: u64,
    pub rejected: BTreeMap<String, u64>,
    pub latency: LatencySummary,
    pub uptime_seconds: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            received_total: AtomicU64::new(0),
            processed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            duplicates_total: AtomicU64::new(0),
            manual_retries_total: AtomicU64::new(0),
            internal_errors_total: AtomicU64::new(0),
            rejected_by_reason: RwLock::new(BTreeMap::new()),
            processing_latency: LatencyHistogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record_received(&self) {
        self.received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, elapsed: Duration) {
        self.processed_total.fetch_add(1, Ordering::Relaxed);
        self.processing_latency.record_duration(elapsed);
    }

    pub fn record_failed(&self, elapsed: Duration) {
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        self.processing_latency.record_duration(elapsed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected delivery, e.g. `signature_mismatch`, `untrusted_ip`
    pub fn record_rejected(&self, reason: &str) {
        *self
            .rejected_by_reason
            .write()
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_manual_retry(&self) {
        self.manual_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_internal_error(&self) {
        self.internal_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self, reason: &str) -> u64 {
        self.rejected_by_reason.read().get(reason).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received_total.load(Ordering::Relaxed),
            processed: self.processed_total.load(Ordering::Relaxed),
            failed: self.failed_total.load(Ordering::Relaxed),
            duplicates: self.duplicates_total.load(Ordering::Relaxed),
            manual_retries: self.manual_retries_total.load(Ordering::Relaxed),
            internal_errors: self.internal_errors_total.load(Ordering::Relaxed),
            rejected: self.rejected_by_reason.read().clone(),
            latency: self.processing_latency.summary(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Convert metrics to Prometheus text format
    pub fn to_prometheus_format(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        let counters = [
            ("received_total", "Webhook deliveries received", snapshot.received),
            ("processed_total", "Events processed successfully", snapshot.processed),
            ("failed_total", "Events that failed processing", snapshot.failed),
            ("duplicates_total", "Duplicate deliveries suppressed", snapshot.duplicates),
            ("manual_retries_total", "Manual retries requested", snapshot.manual_retries),
            ("internal_errors_total", "Unexpected internal errors", snapshot.internal_errors),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {PREFIX}_{name} {help}");
            let _ = writeln!(output, "# TYPE {PREFIX}_{name} counter");
            let _ = writeln!(output, "{PREFIX}_{name} {value}");
        }

        let _ = writeln!(output, "# HELP {PREFIX}_rejected_total Deliveries rejected before processing");
        let _ = writeln!(output, "# TYPE {PREFIX}_rejected_total counter");
        for (reason, count) in &snapshot.rejected {
            let _ = writeln!(output, "{PREFIX}_rejected_total{{reason=\"{reason}\"}} {count}");
        }

        if snapshot.latency.count > 0 {
            let _ = writeln!(output, "# HELP {PREFIX}_processing_duration_ms Processing latency percentiles");
            let _ = writeln!(output, "# TYPE {PREFIX}_processing_duration_ms summary");
            for (quantile, value) in [
                ("0.5", snapshot.latency.p50_ms),
                ("0.95", snapshot.latency.p95_ms),
                ("0.99", snapshot.latency.p99_ms),
            ] {
                let _ = writeln!(
                    output,
                    "{PREFIX}_processing_duration_ms{{quantile=\"{quantile}\"}} {value:.3}"
                );
            }
            let _ = writeln!(output, "{PREFIX}_processing_duration_ms_count {}", snapshot.latency.count);
        }

        let _ = writeln!(output, "# TYPE {PREFIX}_uptime_seconds gauge");
        let _ = writeln!(output, "{PREFIX}_uptime_seconds {}", snapshot.uptime_seconds);

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
