//! Webhook Signature Verification
//!
//! Stripe signs every delivery with the endpoint secret:
//!
//! ```text
//! stripe-signature: t=1700000000,v1=5257a869...,v1=...
//! v1 = hex(HMAC-SHA256(secret, "{t}.{raw body}"))
//! ```
//!
//! The MAC is checked against the exact raw bytes before any JSON parsing.
//! Both the header timestamp and the event's `created` field must be inside
//! the tolerance window.

use std::net::IpAddr;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::stripe::audit::AuditSink;
use crate::stripe::config::StripeWebhookConfig;
use crate::stripe::error::VerificationError;
use crate::stripe::events::WebhookEvent;
use crate::stripe::security::SecurityIncident;

type HmacSha256 = Hmac<Sha256>;

/// Parsed `stripe-signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// Decoded `v1` signatures; there can be several during secret rotation
    pub signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> Result<Self, VerificationError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => {
                    let ts = value.parse::<i64>().map_err(|_| {
                        VerificationError::InvalidSignatureFormat(format!(
                            "timestamp is not an integer: {:?}",
                            value
                        ))
                    })?;
                    timestamp = Some(ts);
                }
                // Non-hex entries can never match; ignore them like other schemes
                "v1" => {
                    if let Ok(sig) = hex::decode(value) {
                        signatures.push(sig);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            VerificationError::InvalidSignatureFormat("missing t= timestamp".to_string())
        })?;
        if signatures.is_empty() {
            return Err(VerificationError::InvalidSignatureFormat(
                "no v1 signature".to_string(),
            ));
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Compute the hex `v1` signature for a payload
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    mac_bytes(secret, timestamp, payload)
        .map(hex::encode)
        .unwrap_or_default()
}

/// Build a complete `stripe-signature` header value (used by tests and tooling)
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)
    )
}

fn mac_bytes(secret: &str, timestamp: i64, payload: &[u8]) -> Option<Vec<u8>> {
    // HMAC accepts keys of any length, so this only fails in theory
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Authenticates inbound deliveries and constructs the event
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
    check_signature: bool,
    audit: Arc<dyn AuditSink>,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
            check_signature: true,
            audit,
        }
    }

    pub fn from_config(config: &StripeWebhookConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self::new(
            config.webhook_secret.clone(),
            config.security.tolerance_window,
            audit,
        )
        .with_signature_validation(config.security.enable_signature_validation)
    }

    /// Skip header parsing, the header timestamp check and the MAC
    /// comparison (local development only).
    ///
    /// The header must still be present and the event `created` window still
    /// applies.
    pub fn with_signature_validation(mut self, enabled: bool) -> Self {
        self.check_signature = enabled;
        self
    }

    pub fn tolerance_secs(&self) -> i64 {
        self.tolerance_secs
    }

    /// Verify a delivery against the current clock.
    ///
    /// Every rejection is also reported as a security incident.
    pub async fn verify(
        &self,
        raw_payload: &[u8],
        signature_header: Option<&str>,
        source_ip: Option<IpAddr>,
    ) -> Result<WebhookEvent, VerificationError> {
        let now = chrono::Utc::now().timestamp();
        match self.construct_event(raw_payload, signature_header, now) {
            Ok(event) => {
                tracing::info!(event_id = %event.id, "Webhook signature validated");
                Ok(event)
            }
            Err(err) => {
                tracing::error!(
                    kind = err.kind(),
                    error = %err,
                    source_ip = ?source_ip,
                    "Webhook signature validation failed"
                );
                let incident = SecurityIncident::new(err.kind(), err.to_string(), source_ip);
                if let Err(e) = self.audit.record_incident(incident).await {
                    tracing::error!(error = %e, "Failed to record security incident");
                }
                Err(err)
            }
        }
    }

    /// Pure verification against an explicit `now` (unix seconds)
    pub fn construct_event(
        &self,
        raw_payload: &[u8],
        signature_header: Option<&str>,
        now: i64,
    ) -> Result<WebhookEvent, VerificationError> {
        let header = signature_header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(VerificationError::MissingSignature)?;

        if self.check_signature {
            let parsed = SignatureHeader::parse(header)?;
            self.check_window(now, parsed.timestamp)?;

            let expected = mac_bytes(&self.secret, parsed.timestamp, raw_payload)
                .ok_or(VerificationError::SignatureMismatch)?;
            // Length is not secret (always 32 bytes for SHA-256)
            let matched = parsed.signatures.iter().any(|sig| {
                sig.len() == expected.len()
                    && bool::from(sig.as_slice().ct_eq(expected.as_slice()))
            });
            if !matched {
                return Err(VerificationError::SignatureMismatch);
            }
        } else {
            tracing::warn!("Webhook signature check skipped (signature validation disabled)");
        }

        let event = WebhookEvent::from_bytes(raw_payload)?;
        // A missing or non-positive `created` is a validation failure, not a replay
        if event.created > 0 {
            self.check_window(now, event.created)?;
        }
        Ok(event)
    }

    fn check_window(&self, now: i64, timestamp: i64) -> Result<(), VerificationError> {
        let age = now.saturating_sub(timestamp).saturating_abs();
        if age > self.tolerance_secs {
            return Err(VerificationError::StaleTimestamp {
                age_secs: age,
                tolerance_secs: self.tolerance_secs,
            });
        }
        Ok(())
    }
}
