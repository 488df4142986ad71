//! Idempotency Guard
//!
//! Duplicate suppression keyed by event ID.
//!
//! The in-memory store claims IDs with an atomic insert-if-absent, so within
//! one process at most one concurrent delivery of an ID proceeds; the rest
//! observe a duplicate. A failed ID can be claimed again, which lets a
//! provider redelivery reprocess it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::stripe::error::{StripeWebhookError, StripeWebhookResult};

/// Processing state of a remembered event ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct IdempotencyRecord {
    state: ProcessingState,
    first_seen: Instant,
    updated: Instant,
}

/// Backing store for idempotency keys
#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Read-only: is the ID live and in progress or completed?
    async fn is_duplicate(&self, event_id: &str) -> anyhow::Result<bool>;

    /// Atomic insert-if-absent. Returns `true` when the caller may process the ID.
    async fn try_claim(&self, event_id: &str) -> anyhow::Result<bool>;

    /// Record the outcome for a claimed ID
    async fn mark(&self, event_id: &str, state: ProcessingState) -> anyhow::Result<()>;
}

/// Bounded in-memory store with a retention TTL
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    ttl: Duration,
    max_entries: usize,
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Current state of an ID, ignoring expiry
    pub fn state(&self, event_id: &str) -> Option<ProcessingState> {
        self.records.lock().get(event_id).map(|r| r.state)
    }

    fn is_live(&self, record: &IdempotencyRecord, now: Instant) -> bool {
        now.duration_since(record.updated) < self.ttl
    }

    fn evict(&self, records: &mut HashMap<String, IdempotencyRecord>, now: Instant) {
        if records.len() < self.max_entries {
            return;
        }

        let ttl = self.ttl;
        records.retain(|_, r| now.duration_since(r.updated) < ttl);

        while records.len() >= self.max_entries {
            let oldest = records
                .iter()
                .min_by_key(|(_, r)| r.first_seen)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    tracing::debug!(event_id = %id, "Evicting idempotency record");
                    records.remove(&id);
                }
                None => break,
            }
        }
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_duplicate(&self, event_id: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        let records = self.records.lock();
        Ok(records.get(event_id).is_some_and(|r| {
            self.is_live(r, now)
                && matches!(r.state, ProcessingState::InProgress | ProcessingState::Completed)
        }))
    }

    async fn try_claim(&self, event_id: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut records = self.records.lock();

        if let Some(existing) = records.get(event_id) {
            let reclaimable =
                !self.is_live(existing, now) || existing.state == ProcessingState::Failed;
            if !reclaimable {
                return Ok(false);
            }
        } else {
            self.evict(&mut records, now);
        }

        records.insert(
            event_id.to_string(),
            IdempotencyRecord {
                state: ProcessingState::InProgress,
                first_seen: now,
                updated: now,
            },
        );
        Ok(true)
    }

    async fn mark(&self, event_id: &str, state: ProcessingState) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut records = self.records.lock();
        match records.get_mut(event_id) {
            Some(record) => {
                record.state = state;
                record.updated = now;
            }
            None => {
                self.evict(&mut records, now);
                records.insert(
                    event_id.to_string(),
                    IdempotencyRecord {
                        state,
                        first_seen: now,
                        updated: now,
                    },
                );
            }
        }
        Ok(())
    }
}

/// Duplicate-suppression front for the ingest service
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }

    pub async fn is_duplicate(&self, event_id: &str) -> StripeWebhookResult<bool> {
        self.store.is_duplicate(event_id).await.map_err(store_error)
    }

    /// Claim an ID for processing; `false` means another delivery owns it
    pub async fn claim(&self, event_id: &str) -> StripeWebhookResult<bool> {
        self.store.try_claim(event_id).await.map_err(store_error)
    }

    pub async fn mark_processed(&self, event_id: &str) -> StripeWebhookResult<()> {
        self.store
            .mark(event_id, ProcessingState::Completed)
            .await
            .map_err(store_error)
    }

    pub async fn mark_failed(&self, event_id: &str) -> StripeWebhookResult<()> {
        self.store
            .mark(event_id, ProcessingState::Failed)
            .await
            .map_err(store_error)
    }
}

fn store_error(err: anyhow::Error) -> StripeWebhookError {
    StripeWebhookError::Store(format!("{:#}", err))
}
