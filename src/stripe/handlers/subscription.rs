//! Subscription lifecycle events
//!
//! Updates branch on status transitions:
//!
//! ```text
//! -> active            restore access
//! -> past_due          dunning
//! -> canceled | unpaid revoke access
//! ```

use crate::stripe::events::{StripeEventType, Subscription, SubscriptionStatus, WebhookEvent};
use crate::stripe::handlers::{downstream_failure, Downstream, Notification};
use crate::stripe::retry::WebhookResult;
use crate::stripe::router::EventHandler;

/// Action taken when a subscription enters a new status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    RestoreAccess,
    Dunning,
    RevokeAccess,
    None,
}

impl StatusTransition {
    pub fn for_status(status: SubscriptionStatus) -> Self {
        match status {
            SubscriptionStatus::Active => Self::RestoreAccess,
            SubscriptionStatus::PastDue => Self::Dunning,
            SubscriptionStatus::Canceled | SubscriptionStatus::Unpaid => Self::RevokeAccess,
            _ => Self::None,
        }
    }
}

pub struct SubscriptionEventHandler {
    downstream: Downstream,
}

impl SubscriptionEventHandler {
    pub const EVENT_TYPES: [StripeEventType; 3] = [
        StripeEventType::SubscriptionCreated,
        StripeEventType::SubscriptionUpdated,
        StripeEventType::SubscriptionDeleted,
    ];

    pub fn new(downstream: Downstream) -> Self {
        Self { downstream }
    }

    async fn created(&self, event_id: &str, sub: &Subscription) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event_id,
            subscription = %sub.id,
            customer = %sub.customer,
            "Processing new subscription"
        );

        let d = &self.downstream;
        d.billing.upsert_subscription(event_id, sub).await?;
        d.access.activate_access(event_id, sub).await?;
        d.notifications
            .notify(event_id, Notification::SubscriptionWelcome, Some(&sub.customer), &sub.id)
            .await?;
        d.access.update_customer_tier(event_id, sub).await?;
        Ok(())
    }

    async fn updated(&self, event: &WebhookEvent, sub: &Subscription) -> anyhow::Result<()> {
        let event_id = event.id.as_str();
        tracing::info!(event_id = %event_id, subscription = %sub.id, "Processing subscription update");

        let d = &self.downstream;
        d.billing.upsert_subscription(event_id, sub).await?;

        let previous = event.previous_attributes();

        let previous_status = previous
            .and_then(|p| p.get("status"))
            .and_then(|s| s.as_str())
            .map(SubscriptionStatus::parse);
        if let Some(old) = previous_status.filter(|old| *old != sub.status) {
            tracing::info!(
                event_id = %event_id,
                subscription = %sub.id,
                from = old.as_str(),
                to = sub.status.as_str(),
                "Subscription status changed"
            );
            match StatusTransition::for_status(sub.status) {
                StatusTransition::RestoreAccess => d.access.activate_access(event_id, sub).await?,
                StatusTransition::Dunning => d.access.start_dunning(event_id, sub).await?,
                StatusTransition::RevokeAccess => d.access.revoke_access(event_id, sub).await?,
                StatusTransition::None => {}
            }
        }

        if let Some(items) = previous.and_then(|p| p.get("items")) {
            d.access.apply_plan_change(event_id, sub, items).await?;
        }

        Ok(())
    }

    async fn deleted(&self, event_id: &str, sub: &Subscription) -> anyhow::Result<()> {
        tracing::info!(event_id = %event_id, subscription = %sub.id, "Processing subscription cancellation");

        let d = &self.downstream;
        d.billing.deactivate_subscription(event_id, sub).await?;
        d.access.revoke_access(event_id, sub).await?;
        d.notifications
            .notify(event_id, Notification::SubscriptionCanceled, Some(&sub.customer), &sub.id)
            .await?;
        d.billing.refund_if_applicable(event_id, sub).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for SubscriptionEventHandler {
    async fn handle(&self, event: &WebhookEvent) -> WebhookResult {
        let sub = match event.as_subscription() {
            Ok(sub) => sub,
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Undecodable subscription payload");
                return WebhookResult::terminal(e.to_string());
            }
        };

        let outcome = match event.typed_event_type() {
            StripeEventType::SubscriptionCreated => self.created(&event.id, &sub).await,
            StripeEventType::SubscriptionUpdated => self.updated(event, &sub).await,
            StripeEventType::SubscriptionDeleted => self.deleted(&event.id, &sub).await,
            _ => {
                return WebhookResult::terminal(format!(
                    "subscription handler cannot process {}",
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
