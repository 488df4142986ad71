//! Built-in Event Handlers
//!
//! Payment, subscription and invoice business logic. Each handler decodes the
//! typed view of its payload and runs a fixed sequence of downstream calls.
//!
//! - A payload that cannot be decoded is a terminal failure.
//! - Any downstream failure is retryable; every downstream call receives the
//!   event ID so implementations can make repeated calls idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::stripe::events::{Invoice, LastPaymentError, PaymentIntent, Subscription};
use crate::stripe::retry::WebhookResult;
use crate::stripe::router::EventRouter;

pub mod invoice;
pub mod payment;
pub mod subscription;

pub use invoice::InvoiceEventHandler;
pub use payment::PaymentEventHandler;
pub use subscription::{StatusTransition, SubscriptionEventHandler};

// =============================================================================
// Downstream Collaborators
// =============================================================================

/// Storefront order status after a payment event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Paid,
    PaymentFailed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::PaymentFailed => "payment_failed",
        }
    }
}

/// Customer-facing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    PaymentConfirmation,
    PaymentFailed,
    PaymentActionRequired,
    SubscriptionWelcome,
    SubscriptionCanceled,
    InvoiceReceipt,
    InvoicePaymentFailed,
}

impl Notification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentConfirmation => "payment_confirmation",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentActionRequired => "payment_action_required",
            Self::SubscriptionWelcome => "subscription_welcome",
            Self::SubscriptionCanceled => "subscription_canceled",
            Self::InvoiceReceipt => "invoice_receipt",
            Self::InvoicePaymentFailed => "invoice_payment_failed",
        }
    }
}

#[async_trait::async_trait]
pub trait OrderService: Send + Sync + 'static {
    async fn update_order_status(
        &self,
        event_id: &str,
        payment: &PaymentIntent,
        status: OrderStatus,
    ) -> anyhow::Result<()>;

    async fn update_inventory(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()>;

    async fn release_inventory(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()>;

    async fn create_shipping_order(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()>;

    async fn record_payment_failure(
        &self,
        event_id: &str,
        payment: &PaymentIntent,
        error: Option<&LastPaymentError>,
    ) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait NotificationService: Send + Sync + 'static {
    /// `customer` is the provider customer ID; `reference` the object it is about
    async fn notify(
        &self,
        event_id: &str,
        notification: Notification,
        customer: Option<&str>,
        reference: &str,
    ) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait AccessControl: Send + Sync + 'static {
    async fn activate_access(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()>;

    async fn revoke_access(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()>;

    async fn update_customer_tier(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()>;

    async fn apply_plan_change(
        &self,
        event_id: &str,
        subscription: &Subscription,
        previous_items: &Value,
    ) -> anyhow::Result<()>;

    /// Past-due handling: grace period, reminders
    async fn start_dunning(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait BillingRecords: Send + Sync + 'static {
    /// Create or update the local subscription record
    async fn upsert_subscription(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()>;

    async fn deactivate_subscription(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()>;

    async fn refund_if_applicable(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()>;

    async fn record_invoice_payment(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()>;

    async fn update_subscription_period(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()>;

    async fn record_invoice_failure(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()>;

    async fn schedule_dunning_retry(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()>;
}

/// The collaborators handlers call into
#[derive(Clone)]
pub struct Downstream {
    pub orders: Arc<dyn OrderService>,
    pub notifications: Arc<dyn NotificationService>,
    pub access: Arc<dyn AccessControl>,
    pub billing: Arc<dyn BillingRecords>,
}

impl Downstream {
    /// Route every concern to one implementation
    pub fn uniform<T>(inner: Arc<T>) -> Self
    where
        T: OrderService + NotificationService + AccessControl + BillingRecords,
    {
        Self {
            orders: inner.clone(),
            notifications: inner.clone(),
            access: inner.clone(),
            billing: inner,
        }
    }

    /// Tracing-only collaborators
    pub fn logging() -> Self {
        Self::uniform(Arc::new(LoggingDownstream))
    }
}

/// Register the payment, subscription and invoice handlers
pub fn register_builtin_handlers(router: &EventRouter, downstream: &Downstream) {
    let payment = Arc::new(PaymentEventHandler::new(downstream.clone()));
    for event_type in PaymentEventHandler::EVENT_TYPES {
        router.register(event_type.as_str(), payment.clone());
    }

    let subscription = Arc::new(SubscriptionEventHandler::new(downstream.clone()));
    for event_type in SubscriptionEventHandler::EVENT_TYPES {
        router.register(event_type.as_str(), subscription.clone());
    }

    let invoice = Arc::new(InvoiceEventHandler::new(downstream.clone()));
    for event_type in InvoiceEventHandler::EVENT_TYPES {
        router.register(event_type.as_str(), invoice.clone());
    }

    tracing::info!(
        handlers = router.handler_count(),
        "Registered built-in webhook handlers"
    );
}

/// Map a downstream error to a retryable result
pub(crate) fn downstream_failure(event_id: &str, event_type: &str, err: anyhow::Error) -> WebhookResult {
    let message = format!("{:#}", err);
    tracing::error!(
        event_id = %event_id,
        event_type = %event_type,
        error = %message,
        "Webhook handler failed"
    );
    WebhookResult::retryable(message)
}

// =============================================================================
// Logging Downstream
// =============================================================================

/// Collaborators that only log what they would do
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDownstream;

#[async_trait::async_trait]
impl OrderService for LoggingDownstream {
    async fn update_order_status(
        &self,
        event_id: &str,
        payment: &PaymentIntent,
        status: OrderStatus,
    ) -> anyhow::Result<()> {
        match payment.order_id() {
            Some(order_id) => tracing::info!(
                event_id = %event_id,
                order_id = %order_id,
                status = status.as_str(),
                "Updating order status"
            ),
            None => tracing::warn!(
                event_id = %event_id,
                payment_intent = %payment.id,
                "Payment intent has no orderId metadata"
            ),
        }
        Ok(())
    }

    async fn update_inventory(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()> {
        tracing::info!(event_id = %event_id, payment_intent = %payment.id, "Updating inventory");
        Ok(())
    }

    async fn release_inventory(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()> {
        tracing::info!(event_id = %event_id, payment_intent = %payment.id, "Releasing inventory reservation");
        Ok(())
    }

    async fn create_shipping_order(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()> {
        tracing::info!(event_id = %event_id, payment_intent = %payment.id, "Creating shipping order");
        Ok(())
    }

    async fn record_payment_failure(
        &self,
        event_id: &str,
        payment: &PaymentIntent,
        error: Option<&LastPaymentError>,
    ) -> anyhow::Result<()> {
        tracing::warn!(
            event_id = %event_id,
            payment_intent = %payment.id,
            code = ?error.and_then(|e| e.code.as_deref()),
            reason = ?error.and_then(|e| e.message.as_deref()),
            "Payment failed"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl NotificationService for LoggingDownstream {
    async fn notify(
        &self,
        event_id: &str,
        notification: Notification,
        customer: Option<&str>,
        reference: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event_id,
            notification = notification.as_str(),
            customer = ?customer,
            reference = %reference,
            "Sending notification"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl AccessControl for LoggingDownstream {
    async fn activate_access(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        tracing::info!(event_id = %event_id, subscription = %subscription.id, "Activating customer access");
        Ok(())
    }

    async fn revoke_access(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        tracing::info!(event_id = %event_id, subscription = %subscription.id, "Revoking customer access");
        Ok(())
    }

    async fn update_customer_tier(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        tracing::info!(event_id = %event_id, subscription = %subscription.id, "Updating customer tier");
        Ok(())
    }

    async fn apply_plan_change(
        &self,
        event_id: &str,
        subscription: &Subscription,
        _previous_items: &Value,
    ) -> anyhow::Result<()> {
        tracing::info!(event_id = %event_id, subscription = %subscription.id, "Applying plan change");
        Ok(())
    }

    async fn start_dunning(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        tracing::warn!(event_id = %event_id, subscription = %subscription.id, "Subscription is past due");
        Ok(())
    }
}

#[async_trait::async_trait]
impl BillingRecords for LoggingDownstream {
    async fn upsert_subscription(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event_id,
            subscription = %subscription.id,
            status = subscription.status.as_str(),
            "Saving subscription record"
        );
        Ok(())
    }

    async fn deactivate_subscription(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        tracing::info!(event_id = %event_id, subscription = %subscription.id, "Deactivating subscription");
        Ok(())
    }

    async fn refund_if_applicable(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        tracing::info!(event_id = %event_id, subscription = %subscription.id, "Checking for refund");
        Ok(())
    }

    async fn record_invoice_payment(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event_id,
            invoice = %invoice.id,
            amount_paid = invoice.amount_paid,
            "Recording invoice payment"
        );
        Ok(())
    }

    async fn update_subscription_period(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event_id,
            invoice = %invoice.id,
            subscription = ?invoice.subscription,
            period_end = ?invoice.period_end,
            "Updating subscription period"
        );
        Ok(())
    }

    async fn record_invoice_failure(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()> {
        tracing::warn!(
            event_id = %event_id,
            invoice = %invoice.id,
            amount_due = invoice.amount_due,
            "Recording invoice payment failure"
        );
        Ok(())
    }

    async fn schedule_dunning_retry(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event_id,
            invoice = %invoice.id,
            next_attempt = ?invoice.next_payment_attempt,
            "Scheduling dunning retry"
        );
        Ok(())
    }
}

// =============================================================================
// Recording Downstream
// =============================================================================

/// One downstream call observed by [`RecordingDownstream`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamCall {
    pub event_id: String,
    pub action: &'static str,
    pub reference: String,
}

/// In-memory collaborators that record every call, with injectable failures.
///
/// Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingDownstream {
    calls: Mutex<Vec<DownstreamCall>>,
    /// action -> remaining failures (`None` = fail forever)
    failures: Mutex<HashMap<&'static str, Option<u32>>>,
}

impl RecordingDownstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `action` fail on every call
    pub fn fail_always(&self, action: &'static str) {
        self.failures.lock().insert(action, None);
    }

    /// Make `action` fail for its next `times` calls
    pub fn fail_times(&self, action: &'static str, times: u32) {
        self.failures.lock().insert(action, Some(times));
    }

    pub fn calls(&self) -> Vec<DownstreamCall> {
        self.calls.lock().clone()
    }

    /// Recorded action names, in call order
    pub fn actions(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|c| c.action).collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.action == action).count()
    }

    fn record(&self, event_id: &str, action: &'static str, reference: &str) -> anyhow::Result<()> {
        self.calls.lock().push(DownstreamCall {
            event_id: event_id.to_string(),
            action,
            reference: reference.to_string(),
        });

        let mut failures = self.failures.lock();
        let fail = match failures.get_mut(action) {
            Some(None) => true,
            Some(Some(0)) | None => false,
            Some(Some(remaining)) => {
                *remaining -= 1;
                true
            }
        };
        if fail {
            anyhow::bail!("{} failed for {}", action, reference);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl OrderService for RecordingDownstream {
    async fn update_order_status(
        &self,
        event_id: &str,
        payment: &PaymentIntent,
        status: OrderStatus,
    ) -> anyhow::Result<()> {
        let action = match status {
            OrderStatus::Paid => "order_paid",
            OrderStatus::PaymentFailed => "order_payment_failed",
        };
        self.record(event_id, action, payment.order_id().unwrap_or(&payment.id))
    }

    async fn update_inventory(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()> {
        self.record(event_id, "update_inventory", &payment.id)
    }

    async fn release_inventory(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()> {
        self.record(event_id, "release_inventory", &payment.id)
    }

    async fn create_shipping_order(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()> {
        self.record(event_id, "create_shipping_order", &payment.id)
    }

    async fn record_payment_failure(
        &self,
        event_id: &str,
        payment: &PaymentIntent,
        error: Option<&LastPaymentError>,
    ) -> anyhow::Result<()> {
        let reason = error
            .and_then(|e| e.message.as_deref())
            .unwrap_or(&payment.id);
        self.record(event_id, "record_payment_failure", reason)
    }
}

#[async_trait::async_trait]
impl NotificationService for RecordingDownstream {
    async fn notify(
        &self,
        event_id: &str,
        notification: Notification,
        _customer: Option<&str>,
        reference: &str,
    ) -> anyhow::Result<()> {
        self.record(event_id, notification.as_str(), reference)
    }
}

#[async_trait::async_trait]
impl AccessControl for RecordingDownstream {
    async fn activate_access(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        self.record(event_id, "activate_access", &subscription.id)
    }

    async fn revoke_access(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        self.record(event_id, "revoke_access", &subscription.id)
    }

    async fn update_customer_tier(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        self.record(event_id, "update_customer_tier", &subscription.id)
    }

    async fn apply_plan_change(
        &self,
        event_id: &str,
        subscription: &Subscription,
        _previous_items: &Value,
    ) -> anyhow::Result<()> {
        self.record(event_id, "apply_plan_change", &subscription.id)
    }

    async fn start_dunning(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        self.record(event_id, "start_dunning", &subscription.id)
    }
}

#[async_trait::async_trait]
impl BillingRecords for RecordingDownstream {
    async fn upsert_subscription(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        self.record(event_id, "upsert_subscription", &subscription.id)
    }

    async fn deactivate_subscription(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        self.record(event_id, "deactivate_subscription", &subscription.id)
    }

    async fn refund_if_applicable(&self, event_id: &str, subscription: &Subscription) -> anyhow::Result<()> {
        self.record(event_id, "refund_if_applicable", &subscription.id)
    }

    async fn record_invoice_payment(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()> {
        self.record(event_id, "record_invoice_payment", &invoice.id)
    }

    async fn update_subscription_period(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()> {
        self.record(event_id, "update_subscription_period", &invoice.id)
    }

    async fn record_invoice_failure(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()> {
        self.record(event_id, "record_invoice_failure", &invoice.id)
    }

    async fn schedule_dunning_retry(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()> {
        self.record(event_id, "schedule_dunning_retry", &invoice.id)
    }
}
