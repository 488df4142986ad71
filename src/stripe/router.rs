//! Event Router
//!
//! Explicit registry from event type to handler. Built at startup and handed
//! to the ingest service; handlers may be added or replaced at runtime but
//! never removed.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;

use crate::stripe::events::WebhookEvent;
use crate::stripe::retry::{panic_message, WebhookResult};

/// Business logic for one or more event types
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &WebhookEvent) -> WebhookResult;
}

/// Adapter for closure handlers
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(WebhookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WebhookResult> + Send + 'static,
{
    async fn handle(&self, event: &WebhookEvent) -> WebhookResult {
        (self.f)(event.clone()).await
    }
}

/// Maps event types to handlers
#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; the last registration for a type wins
    pub fn register(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        let replaced = self
            .handlers
            .write()
            .insert(event_type.clone(), handler)
            .is_some();

        if replaced {
            tracing::info!(event_type = %event_type, "Replaced webhook handler");
        } else {
            tracing::debug!(event_type = %event_type, "Registered webhook handler");
        }
    }

    /// Register a closure as a handler
    pub fn register_fn<F, Fut>(&self, event_type: impl Into<String>, f: F)
    where
        F: Fn(WebhookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebhookResult> + Send + 'static,
    {
        self.register(event_type, Arc::new(FnHandler::new(f)));
    }

    /// Route an event to its handler.
    ///
    /// Unknown types succeed with a note so the provider stops redelivering
    /// them. A panicking handler becomes a retryable failure.
    pub async fn dispatch(&self, event: &WebhookEvent) -> WebhookResult {
        let handler = self.handlers.read().get(&event.event_type).cloned();

        let Some(handler) = handler else {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "No handler registered for event type"
            );
            return WebhookResult::ok_with_note(format!("no handler for {}", event.event_type));
        };

        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %message,
                    "Webhook handler panicked"
                );
                WebhookResult::retryable(message)
            }
        }
    }

    pub fn has_handler(&self, event_type: &str) -> bool {
        self.handlers.read().contains_key(event_type)
    }

    /// Registered event types, sorted
    pub fn supported_event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}
