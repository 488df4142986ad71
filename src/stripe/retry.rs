//! Retry Executor
//!
//! Runs a handler with bounded retries and exponential backoff.
//!
//! ```text
//! Attempting(n) --success--------------------------> Done(success)
//!      |        --failure, retryable=false---------> Done(failure)
//!      |        --failure/panic, n == max_attempts-> Done(failure)
//!      +--------failure/panic, n <  max_attempts-> sleep(delay(n)) -> Attempting(n+1)
//! ```
//!
//! The backoff sleep is a tokio timer, so only the current task is suspended.
//! Every terminal outcome writes exactly one [`WebhookLogEntry`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::stripe::audit::{AuditSink, WebhookLogEntry};

/// Outcome of processing one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Only meaningful when `success` is false; absent means retryable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl WebhookResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            retryable: None,
        }
    }

    /// Success carrying an informational note (e.g. an unhandled event type)
    pub fn ok_with_note(note: impl Into<String>) -> Self {
        Self {
            success: true,
            error: Some(note.into()),
            retryable: None,
        }
    }

    /// Transient failure; a later attempt may succeed
    pub fn retryable(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retryable: Some(true),
        }
    }

    /// Terminal failure; retrying cannot help
    pub fn terminal(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retryable: Some(false),
        }
    }

    /// Whether another attempt is allowed for this result
    pub fn is_retryable(&self) -> bool {
        !self.success && self.retryable.unwrap_or(true)
    }
}

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first (>= 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor per attempt (> 1)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Check the invariants the executor relies on
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry max_attempts must be at least 1".to_string());
        }
        if !(self.backoff_multiplier > 1.0) || !self.backoff_multiplier.is_finite() {
            return Err(format!(
                "retry backoff_multiplier must be a finite number greater than 1, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_delay < self.base_delay {
            return Err("retry max_delay must not be smaller than base_delay".to_string());
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (1-indexed):
    /// `min(base_delay * multiplier^(attempt-1), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let max_millis = self.max_delay.as_millis() as f64;

        if !millis.is_finite() || millis >= max_millis {
            self.max_delay
        } else {
            Duration::from_millis(millis.round() as u64)
        }
    }
}

/// Executes handlers with retry and records one audit entry per event
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    audit: Arc<dyn AuditSink>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self { config, audit }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `handler` under the executor's own config
    pub async fn execute_with_retry<F, Fut>(
        &self,
        event_id: &str,
        event_type: &str,
        handler: F,
    ) -> WebhookResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WebhookResult>,
    {
        self.execute_with_config(event_id, event_type, &self.config, handler)
            .await
    }

    /// Run `handler` under an explicit config.
    ///
    /// Never panics: a panicking attempt counts as a retryable failure.
    pub async fn execute_with_config<F, Fut>(
        &self,
        event_id: &str,
        event_type: &str,
        config: &RetryConfig,
        mut handler: F,
    ) -> WebhookResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WebhookResult>,
    {
        let started = Instant::now();
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                attempt,
                max_attempts,
                "Executing webhook handler"
            );

            let result = match AssertUnwindSafe(handler()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => WebhookResult::retryable(panic_message(panic.as_ref())),
            };

            if result.success {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Event processed successfully"
                );
                self.record(event_id, event_type, attempt, None).await;
                return result;
            }

            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());

            if !result.is_retryable() {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event_type,
                    attempts = attempt,
                    error = %error,
                    "Event processing failed with non-retryable error"
                );
                self.record(event_id, event_type, attempt, Some(&error)).await;
                return result;
            }

            if attempt >= max_attempts {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event_type,
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %error,
                    "Event processing failed, retry attempts exhausted"
                );
                self.record(event_id, event_type, attempt, Some(&error)).await;
                return WebhookResult::terminal(error);
            }

            let delay = config.delay_for_attempt(attempt);
            tracing::warn!(
                event_id = %event_id,
                event_type = %event_type,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Event processing failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn record(&self, event_id: &str, event_type: &str, attempts: u32, error: Option<&str>) {
        let entry = WebhookLogEntry::new(event_id, event_type, attempts, error.map(str::to_string));
        if let Err(e) = self.audit.record_attempts(entry).await {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to persist webhook log entry"
            );
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
