//! Webhook Security Helpers
//!
//! Source-IP allow listing, security incident records, and payload
//! sanitisation for logs.
//!
//! Stripe does not publish a stable address set for every region, so the
//! allow list is off unless explicitly enabled.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::stripe::config::SecurityConfig;
use crate::stripe::events::WebhookEvent;

// =============================================================================
// IP Allow List
// =============================================================================

/// Source address filter for the webhook endpoint
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    enabled: bool,
    trusted: HashSet<IpAddr>,
}

impl IpAllowList {
    pub fn new(enabled: bool, trusted: HashSet<IpAddr>) -> Self {
        Self { enabled, trusted }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.enable_ip_validation, config.trusted_ips.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check a source address. An unknown source only passes when the
    /// filter is disabled.
    pub fn is_allowed(&self, ip: Option<IpAddr>) -> bool {
        if !self.enabled {
            return true;
        }

        match ip {
            Some(ip) => {
                // IPv4-mapped IPv6 (::ffff:a.b.c.d) from dual-stack listeners
                let canonical = match ip {
                    IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
                    v4 => v4,
                };
                self.trusted.contains(&ip) || self.trusted.contains(&canonical)
            }
            None => false,
        }
    }

    pub fn allow_ip(&mut self, ip: IpAddr) {
        self.trusted.insert(ip);
    }
}

// =============================================================================
// Security Incidents
// =============================================================================

/// A rejected delivery worth alerting on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityIncident {
    /// e.g. `signature_mismatch`, `untrusted_ip`
    pub kind: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SecurityIncident {
    pub fn new(kind: impl Into<String>, error: impl Into<String>, source_ip: Option<IpAddr>) -> Self {
        Self {
            kind: kind.into(),
            error: error.into(),
            source_ip: source_ip.map(|ip| ip.to_string()),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Log Sanitisation
// =============================================================================

/// Summary of an event that is safe to log.
///
/// Only the envelope and the object's own id/kind survive; amounts,
/// emails, addresses and metadata are dropped.
pub fn sanitize_event_for_logging(event: &WebhookEvent) -> Value {
    let object = event.object();
    let field = |name: &str| {
        object
            .and_then(|o| o.get(name))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };

    json!({
        "id": event.id,
        "type": event.event_type,
        "created": event.created,
        "livemode": event.livemode,
        "data": {
            "object": {
                "id": field("id"),
                "object": field("object"),
            }
        }
    })
}
