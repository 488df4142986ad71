//! Payment intent events

use crate::stripe::events::{PaymentIntent, StripeEventType, WebhookEvent};
use crate::stripe::handlers::{downstream_failure, Downstream, Notification, OrderStatus};
use crate::stripe::retry::WebhookResult;
use crate::stripe::router::EventHandler;

pub struct PaymentEventHandler {
    downstream: Downstream,
}

impl PaymentEventHandler {
    pub const EVENT_TYPES: [StripeEventType; 3] = [
        StripeEventType::PaymentIntentSucceeded,
        StripeEventType::PaymentIntentPaymentFailed,
        StripeEventType::PaymentIntentRequiresAction,
    ];

    pub fn new(downstream: Downstream) -> Self {
        Self { downstream }
    }

    async fn succeeded(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event_id,
            payment_intent = %payment.id,
            amount = payment.amount,
            currency = %payment.currency,
            "Processing successful payment"
        );

        let d = &self.downstream;
        d.orders
            .update_order_status(event_id, payment, OrderStatus::Paid)
            .await?;
        d.notifications
            .notify(
                event_id,
                Notification::PaymentConfirmation,
                payment.customer.as_deref(),
                &payment.id,
            )
            .await?;
        d.orders.update_inventory(event_id, payment).await?;
        d.orders.create_shipping_order(event_id, payment).await?;
        Ok(())
    }

    async fn failed(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()> {
        tracing::warn!(
            event_id = %event_id,
            payment_intent = %payment.id,
            "Processing failed payment"
        );

        let d = &self.downstream;
        d.orders
            .update_order_status(event_id, payment, OrderStatus::PaymentFailed)
            .await?;
        d.orders.release_inventory(event_id, payment).await?;
        d.notifications
            .notify(
                event_id,
                Notification::PaymentFailed,
                payment.customer.as_deref(),
                &payment.id,
            )
            .await?;
        d.orders
            .record_payment_failure(event_id, payment, payment.last_payment_error.as_ref())
            .await?;
        Ok(())
    }

    async fn requires_action(&self, event_id: &str, payment: &PaymentIntent) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event_id,
            payment_intent = %payment.id,
            "Payment requires customer action"
        );

        self.downstream
            .notifications
            .notify(
                event_id,
                Notification::PaymentActionRequired,
                payment.customer.as_deref(),
                &payment.id,
            )
            .await
    }
}

#[async_trait::async_trait]
impl EventHandler for PaymentEventHandler {
    async fn handle(&self, event: &WebhookEvent) -> WebhookResult {
        let payment = match event.as_payment_intent() {
            Ok(payment) => payment,
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Undecodable payment payload");
                return WebhookResult::terminal(e.to_string());
            }
        };

        let outcome = match event.typed_event_type() {
            StripeEventType::PaymentIntentSucceeded => self.succeeded(&event.id, &payment).await,
            StripeEventType::PaymentIntentPaymentFailed => self.failed(&event.id, &payment).await,
            StripeEventType::PaymentIntentRequiresAction => {
                self.requires_action(&event.id, &payment).await
            }
            _ => {
                return WebhookResult::terminal(format!(
                    "payment handler cannot process {}",
                    event.event_type
                ))
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!(event_id = %event.id, payment_intent = %payment.id, "Payment event processed");
                WebhookResult::ok()
            }
            Err(e) => downstream_failure(&event.id, &event.event_type, e),
        }
    }
}
