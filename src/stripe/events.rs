//! Stripe Event Types
//!
//! Strongly-typed representations of the Stripe webhook events the storefront
//! reacts to: payment intents, subscriptions and invoices.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::stripe::error::VerificationError;

/// Stripe event types with built-in handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StripeEventType {
    // Payment intent events
    PaymentIntentSucceeded,
    PaymentIntentPaymentFailed,
    PaymentIntentRequiresAction,

    // Subscription events
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,

    // Invoice events
    InvoicePaid,
    InvoicePaymentFailed,

    // Catch-all for events we don't explicitly handle
    Unknown,
}

impl FromStr for StripeEventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded,
            "payment_intent.payment_failed" => Self::PaymentIntentPaymentFailed,
            "payment_intent.requires_action" => Self::PaymentIntentRequiresAction,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            _ => Self::Unknown,
        })
    }
}

impl StripeEventType {
    /// Every type with a built-in handler
    pub const BUILT_IN: [StripeEventType; 8] = [
        Self::PaymentIntentSucceeded,
        Self::PaymentIntentPaymentFailed,
        Self::PaymentIntentRequiresAction,
        Self::SubscriptionCreated,
        Self::SubscriptionUpdated,
        Self::SubscriptionDeleted,
        Self::InvoicePaid,
        Self::InvoicePaymentFailed,
    ];

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentIntentSucceeded => "payment_intent.succeeded",
            Self::PaymentIntentPaymentFailed => "payment_intent.payment_failed",
            Self::PaymentIntentRequiresAction => "payment_intent.requires_action",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::Unknown => "unknown",
        }
    }

    /// Payload family this event type carries
    pub fn family(&self) -> EventFamily {
        match self {
            Self::PaymentIntentSucceeded
            | Self::PaymentIntentPaymentFailed
            | Self::PaymentIntentRequiresAction => EventFamily::Payment,
            Self::SubscriptionCreated | Self::SubscriptionUpdated | Self::SubscriptionDeleted => {
                EventFamily::Subscription
            }
            Self::InvoicePaid | Self::InvoicePaymentFailed => EventFamily::Invoice,
            Self::Unknown => EventFamily::Unknown,
        }
    }
}

/// Payload families, one per handler group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    Payment,
    Subscription,
    Invoice,
    Unknown,
}

/// Generic Stripe event envelope.
///
/// Fields the provider always sends are still defaulted so that a structurally
/// broken event reaches the validator instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Unique identifier for the event (evt_...)
    #[serde(default)]
    pub id: String,

    /// Type of event
    #[serde(rename = "type", default)]
    pub event_type: String,

    /// Time of event creation (Unix timestamp)
    #[serde(default)]
    pub created: i64,

    /// API version used to render data
    #[serde(default)]
    pub api_version: Option<String>,

    /// Whether this is a live mode event
    #[serde(default)]
    pub livemode: bool,

    /// Number of times Stripe has attempted to deliver
    #[serde(default)]
    pub pending_webhooks: u32,

    /// Object containing event data
    #[serde(default)]
    pub data: Option<EventData>,
}

impl WebhookEvent {
    /// Parse from raw JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VerificationError> {
        serde_json::from_slice(bytes).map_err(|e| VerificationError::InvalidPayload(e.to_string()))
    }

    /// Get the typed event type
    pub fn typed_event_type(&self) -> StripeEventType {
        match StripeEventType::from_str(&self.event_type) {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }

    /// The raw `data.object`, if present
    pub fn object(&self) -> Option<&serde_json::Value> {
        self.data.as_ref().map(|d| &d.object)
    }

    /// The raw `data.previous_attributes`, if present
    pub fn previous_attributes(&self) -> Option<&serde_json::Value> {
        self.data.as_ref().and_then(|d| d.previous_attributes.as_ref())
    }

    /// Decode the payload into the typed view for this event's family.
    ///
    /// Unknown families are returned as-is.
    pub fn payload(&self) -> Result<EventPayload, PayloadError> {
        let object = self.object().ok_or(PayloadError::MissingData)?;

        let payload = match self.typed_event_type().family() {
            EventFamily::Payment => EventPayload::Payment(decode(object, "payment_intent")?),
            EventFamily::Subscription => {
                EventPayload::Subscription(decode(object, "subscription")?)
            }
            EventFamily::Invoice => EventPayload::Invoice(decode(object, "invoice")?),
            EventFamily::Unknown => EventPayload::Unknown(object.clone()),
        };

        Ok(payload)
    }

    /// Decode as a payment intent
    pub fn as_payment_intent(&self) -> Result<PaymentIntent, PayloadError> {
        match self.payload()? {
            EventPayload::Payment(pi) => Ok(pi),
            _ => Err(PayloadError::WrongFamily {
                event_type: self.event_type.clone(),
                expected: "payment_intent",
            }),
        }
    }

    /// Decode as a subscription
    pub fn as_subscription(&self) -> Result<Subscription, PayloadError> {
        match self.payload()? {
            EventPayload::Subscription(sub) => Ok(sub),
            _ => Err(PayloadError::WrongFamily {
                event_type: self.event_type.clone(),
                expected: "subscription",
            }),
        }
    }

    /// Decode as an invoice
    pub fn as_invoice(&self) -> Result<Invoice, PayloadError> {
        match self.payload()? {
            EventPayload::Invoice(invoice) => Ok(invoice),
            _ => Err(PayloadError::WrongFamily {
                event_type: self.event_type.clone(),
                expected: "invoice",
            }),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    object: &serde_json::Value,
    kind: &'static str,
) -> Result<T, PayloadError> {
    serde_json::from_value(object.clone()).map_err(|e| PayloadError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

/// Event data container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// The actual event object (payment intent, subscription, invoice, etc.)
    pub object: serde_json::Value,

    /// Previous values for updated fields (only in *.updated events)
    #[serde(default)]
    pub previous_attributes: Option<serde_json::Value>,
}

/// Typed view over `data.object`
#[derive(Debug, Clone)]
pub enum EventPayload {
    Payment(PaymentIntent),
    Subscription(Subscription),
    Invoice(Invoice),
    Unknown(serde_json::Value),
}

/// Why a payload could not be decoded for its family.
///
/// Retrying never fixes these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Event has no data object")]
    MissingData,

    #[error("Malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("Event {event_type} is not a {expected} event")]
    WrongFamily {
        event_type: String,
        expected: &'static str,
    },
}

// =============================================================================
// Payment Intent Types
// =============================================================================

/// Stripe payment intent object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Payment intent ID (pi_...)
    pub id: String,
    /// Amount in the smallest currency unit
    pub amount: i64,
    /// Currency
    pub currency: String,
    /// Customer ID, when the intent is attached to one
    #[serde(default)]
    pub customer: Option<String>,
    /// Payment intent status
    pub status: String,
    /// Metadata; the storefront stores `orderId` here at checkout
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Error from the last payment attempt
    #[serde(default)]
    pub last_payment_error: Option<LastPaymentError>,
}

impl PaymentIntent {
    /// Storefront order this payment belongs to
    pub fn order_id(&self) -> Option<&str> {
        self.metadata.get("orderId").map(String::as_str)
    }
}

/// Details of a failed payment attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastPaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub decline_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Subscription Types
// =============================================================================

/// Stripe subscription object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription ID (sub_...)
    pub id: String,
    /// Customer ID (cus_...)
    pub customer: String,
    /// Subscription status
    pub status: SubscriptionStatus,
    /// Current billing period start (Unix timestamp)
    pub current_period_start: i64,
    /// Current billing period end (Unix timestamp)
    pub current_period_end: i64,
    /// Whether subscription will cancel at period end
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// When the subscription was canceled (if applicable)
    #[serde(default)]
    pub canceled_at: Option<i64>,
    /// Subscription items (plans/prices)
    #[serde(default)]
    pub items: Option<SubscriptionItems>,
    /// Metadata attached to the subscription
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Unpaid,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Trialing,
    Paused,
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    /// Parse the provider's status string
    pub fn parse(s: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(s.to_string())).unwrap_or(Self::Unknown)
    }

    /// Check if subscription is in a "good" state
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Check if subscription requires payment attention
    pub fn requires_payment_action(&self) -> bool {
        matches!(self, Self::PastDue | Self::Unpaid | Self::Incomplete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Trialing => "trialing",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }
}

/// Subscription items container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItems {
    /// List of subscription items
    pub data: Vec<SubscriptionItem>,
}

/// Individual subscription item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    /// Item ID
    pub id: String,
    /// Price object
    pub price: Price,
    /// Quantity
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

/// Price object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    /// Price ID
    pub id: String,
    /// Product ID
    pub product: String,
    /// Unit amount in the smallest currency unit
    #[serde(default)]
    pub unit_amount: Option<i64>,
    /// Currency
    pub currency: String,
}

// =============================================================================
// Invoice Types
// =============================================================================

/// Stripe invoice object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    /// Invoice ID (in_...)
    pub id: String,
    /// Customer ID
    pub customer: String,
    /// Associated subscription ID (if any)
    #[serde(default)]
    pub subscription: Option<String>,
    /// Invoice status
    #[serde(default)]
    pub status: Option<String>,
    /// Total amount due
    pub amount_due: i64,
    /// Amount paid
    pub amount_paid: i64,
    /// Currency
    #[serde(default)]
    pub currency: Option<String>,
    /// Customer email at time of invoice
    #[serde(default)]
    pub customer_email: Option<String>,
    /// Period end of the billed subscription cycle
    #[serde(default)]
    pub period_end: Option<i64>,
    /// When Stripe will next retry collection, for failed invoices
    #[serde(default)]
    pub next_payment_attempt: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
