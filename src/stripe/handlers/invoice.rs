//! Invoice events

use crate::stripe::events::{Invoice, StripeEventType, WebhookEvent};
use crate::stripe::handlers::{downstream_failure, Downstream, Notification};
use crate::stripe::retry::WebhookResult;
use crate::stripe::router::EventHandler;

pub struct InvoiceEventHandler {
    downstream: Downstream,
}

impl InvoiceEventHandler {
    pub const EVENT_TYPES: [StripeEventType; 2] = [
        StripeEventType::InvoicePaid,
        StripeEventType::InvoicePaymentFailed,
    ];

    pub fn new(downstream: Downstream) -> Self {
        Self { downstream }
    }

    async fn paid(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event_id,
            invoice = %invoice.id,
            amount_paid = invoice.amount_paid,
            "Processing paid invoice"
        );

        let d = &self.downstream;
        d.billing.record_invoice_payment(event_id, invoice).await?;
        // One-off invoices have no subscription period to extend
        if invoice.subscription.is_some() {
            d.billing.update_subscription_period(event_id, invoice).await?;
        }
        d.notifications
            .notify(
                event_id,
                Notification::InvoiceReceipt,
                Some(&invoice.customer),
                &invoice.id,
            )
            .await?;
        Ok(())
    }

    async fn payment_failed(&self, event_id: &str, invoice: &Invoice) -> anyhow::Result<()> {
        tracing::warn!(
            event_id = %event_id,
            invoice = %invoice.id,
            amount_due = invoice.amount_due,
            "Processing failed invoice payment"
        );

        let d = &self.downstream;
        d.billing.record_invoice_failure(event_id, invoice).await?;
        d.notifications
            .notify(
                event_id,
                Notification::InvoicePaymentFailed,
                Some(&invoice.customer),
                &invoice.id,
            )
            .await?;
        d.billing.schedule_dunning_retry(event_id, invoice).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for InvoiceEventHandler {
    async fn handle(&self, event: &WebhookEvent) -> WebhookResult {
        let invoice = match event.as_invoice() {
            Ok(invoice) => invoice,
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Undecodable invoice payload");
                return WebhookResult::terminal(e.to_string());
            }
        };

        let outcome = match event.typed_event_type() {
            StripeEventType::InvoicePaid => self.paid(&event.id, &invoice).await,
            StripeEventType::InvoicePaymentFailed => self.payment_failed(&event.id, &invoice).await,
            _ => {
                return WebhookResult::terminal(format!(
                    "invoice handler cannot process {}",
                    event.event_type
                ))
            }
        };

        match outcome {
            Ok(()) => WebhookResult::ok(),
            Err(e) => downstream_failure(&event.id, &event.event_type, e),
        }
    }
}
