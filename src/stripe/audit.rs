//! Webhook Audit Log
//!
//! The persistence collaborator for processing outcomes and security
//! incidents. Writes are upsert-by-event-ID; nothing is mutated in place
//! beyond that.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stripe::security::SecurityIncident;

/// Maximum number of security incidents retained in memory
const MAX_INCIDENTS: usize = 1000;

/// Default maximum number of log entries retained in memory
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Outcome of one event's attempt sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookLogEntry {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub processed: bool,
    /// Attempts made in the sequence (>= 1)
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookLogEntry {
    /// Build an entry; `error` of `None` means the sequence succeeded
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        attempts: u32,
        error: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let success = error.is_none();
        Self {
            id: Uuid::new_v4(),
            event_id: event_id.into(),
            event_type: event_type.into(),
            processed: success,
            attempts: attempts.max(1),
            last_attempt: now,
            success,
            error,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Aggregate statistics over recorded log entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    pub total_webhooks: u64,
    pub successful_webhooks: u64,
    pub failed_webhooks: u64,
    pub average_attempts: f64,
}

/// Persistence collaborator for audit records
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync + 'static {
    /// Upsert the log entry for `entry.event_id`
    async fn record_attempts(&self, entry: WebhookLogEntry) -> anyhow::Result<()>;

    /// Append a security incident
    async fn record_incident(&self, incident: SecurityIncident) -> anyhow::Result<()>;

    /// Failed entries, newest first
    async fn failed_entries(&self, limit: usize) -> anyhow::Result<Vec<WebhookLogEntry>>;

    async fn retry_stats(&self) -> anyhow::Result<RetryStats>;
}

/// In-memory audit log
///
/// Holds at most `max_entries` log entries; recording a new event at the cap
/// evicts the least recently updated one.
#[derive(Debug)]
pub struct InMemoryAuditLog {
    entries: RwLock<HashMap<String, WebhookLogEntry>>,
    incidents: RwLock<VecDeque<SecurityIncident>>,
    max_entries: usize,
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log retaining at most `max_entries` entries (minimum 1)
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            incidents: RwLock::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Current entry for an event
    pub fn entry(&self, event_id: &str) -> Option<WebhookLogEntry> {
        self.entries.read().get(event_id).cloned()
    }

    /// Number of events with an entry
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Recorded incidents, oldest first
    pub fn incidents(&self) -> Vec<SecurityIncident> {
        self.incidents.read().iter().cloned().collect()
    }
}

#[async_trait::async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record_attempts(&self, entry: WebhookLogEntry) -> anyhow::Result<()> {
        tracing::debug!(
            event_id = %entry.event_id,
            attempts = entry.attempts,
            success = entry.success,
            "Webhook log entry"
        );

        let mut entries = self.entries.write();
        match entries.get_mut(&entry.event_id) {
            Some(existing) => {
                // Keep identity and creation time of the first record
                existing.event_type = entry.event_type;
                existing.processed = entry.processed;
                existing.attempts = entry.attempts;
                existing.last_attempt = entry.last_attempt;
                existing.success = entry.success;
                existing.error = entry.error;
                existing.updated_at = entry.updated_at;
            }
            None => {
                if entries.len() >= self.max_entries {
                    let oldest = entries
                        .values()
                        .min_by_key(|e| e.updated_at)
                        .map(|e| e.event_id.clone());
                    if let Some(oldest) = oldest {
                        tracing::debug!(event_id = %oldest, "Evicting oldest webhook log entry");
                        entries.remove(&oldest);
                    }
                }
                entries.insert(entry.event_id.clone(), entry);
            }
        }
        Ok(())
    }

    async fn record_incident(&self, incident: SecurityIncident) -> anyhow::Result<()> {
        tracing::error!(
            kind = %incident.kind,
            error = %incident.error,
            source_ip = ?incident.source_ip,
            "Webhook security incident"
        );

        let mut incidents = self.incidents.write();
        if incidents.len() >= MAX_INCIDENTS {
            incidents.pop_front();
        }
        incidents.push_back(incident);
        Ok(())
    }

    async fn failed_entries(&self, limit: usize) -> anyhow::Result<Vec<WebhookLogEntry>> {
        let mut failed: Vec<WebhookLogEntry> = self
            .entries
            .read()
            .values()
            .filter(|e| !e.success)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.last_attempt.cmp(&a.last_attempt));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn retry_stats(&self) -> anyhow::Result<RetryStats> {
        let entries = self.entries.read();
        let total = entries.len() as u64;
        if total == 0 {
            return Ok(RetryStats::default());
        }

        let successful = entries.values().filter(|e| e.success).count() as u64;
        let attempts: u64 = entries.values().map(|e| u64::from(e.attempts)).sum();

        Ok(RetryStats {
            total_webhooks: total,
            successful_webhooks: successful,
            failed_webhooks: total - successful,
            average_attempts: attempts as f64 / total as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_upsert_keeps_one_entry_per_event() {
        let log = InMemoryAuditLog::new();
        log.record_attempts(WebhookLogEntry::new("evt_1", "invoice.paid", 3, Some("boom".into())))
            .await
            .unwrap();
        let first = log.entry("evt_1").unwrap();

        log.record_attempts(WebhookLogEntry::new("evt_1", "invoice.paid", 1, None))
            .await
            .unwrap();
        let second = log.entry("evt_1").unwrap();

        assert_eq!(log.len(), 1);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.success);
        assert_eq!(second.attempts, 1);
        assert_eq!(second.error, None);
    }

    #[tokio::test]
    async fn test_retry_stats() {
        let log = InMemoryAuditLog::new();
        assert_eq!(log.retry_stats().await.unwrap(), RetryStats::default());

        log.record_attempts(WebhookLogEntry::new("evt_a", "invoice.paid", 1, None))
            .await
            .unwrap();
        log.record_attempts(WebhookLogEntry::new("evt_b", "invoice.paid", 2, None))
            .await
            .unwrap();
        log.record_attempts(WebhookLogEntry::new("evt_c", "invoice.paid", 3, Some("x".into())))
            .await
            .unwrap();

        let stats = log.retry_stats().await.unwrap();
        assert_eq!(stats.total_webhooks, 3);
        assert_eq!(stats.successful_webhooks, 2);
        assert_eq!(stats.failed_webhooks, 1);
        assert!((stats.average_attempts - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_failed_entries_limit() {
        let log = InMemoryAuditLog::new();
        for i in 0..5 {
            log.record_attempts(WebhookLogEntry::new(
                format!("evt_{}", i),
                "invoice.paid",
                3,
                Some("down".into()),
            ))
            .await
            .unwrap();
        }
        log.record_attempts(WebhookLogEntry::new("evt_ok", "invoice.paid", 1, None))
            .await
            .unwrap();

        let failed = log.failed_entries(3).await.unwrap();
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|e| !e.success));
    }

    #[tokio::test]
    async fn test_incidents_are_bounded() {
        let log = InMemoryAuditLog::new();
        for _ in 0..(MAX_INCIDENTS + 5) {
            log.record_incident(SecurityIncident::new("signature_mismatch", "bad sig", None))
                .await
                .unwrap();
        }
        assert_eq!(log.incidents().len(), MAX_INCIDENTS);
    }

    #[tokio::test]
    async fn test_entries_are_bounded() {
        let log = InMemoryAuditLog::with_max_entries(3);
        for i in 0..10 {
            log.record_attempts(WebhookLogEntry::new(
                format!("evt_{}", i),
                "invoice.paid",
                3,
                Some("down".into()),
            ))
            .await
            .unwrap();
            // Distinct timestamps so eviction order is deterministic
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        assert_eq!(log.len(), 3);
        assert!(log.entry("evt_0").is_none());
        assert!(log.entry("evt_9").is_some());
        assert_eq!(log.retry_stats().await.unwrap().total_webhooks, 3);
    }

    #[tokio::test]
    async fn test_upsert_at_capacity_does_not_evict() {
        let log = InMemoryAuditLog::with_max_entries(2);
        log.record_attempts(WebhookLogEntry::new("evt_a", "invoice.paid", 1, None))
            .await
            .unwrap();
        log.record_attempts(WebhookLogEntry::new("evt_b", "invoice.paid", 1, None))
            .await
            .unwrap();
        log.record_attempts(WebhookLogEntry::new("evt_a", "invoice.paid", 2, None))
            .await
            .unwrap();

        assert_eq!(log.len(), 2);
        assert!(log.entry("evt_b").is_some());
        assert_eq!(log.entry("evt_a").unwrap().attempts, 2);
    }

    #[test]
    fn test_log_entry_serializes_snake_case() {
        let entry = WebhookLogEntry::new("evt_1", "invoice.paid", 2, None);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event_id"], "evt_1");
        assert_eq!(json["attempts"], 2);
        assert!(json.get("last_attempt").is_some());
        assert!(json.get("eventId").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_retry_stats_serialize_snake_case() {
        let json = serde_json::to_value(RetryStats::default()).unwrap();
        assert_eq!(json["total_webhooks"], 0);
        assert_eq!(json["average_attempts"], 0.0);
    }
}
