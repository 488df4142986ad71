//! Webhook Configuration
//!
//! All settings are loaded from environment variables once at startup.
//! The signing secret is never logged.
//!
//! # Environment Variables
//!
//! - `STRIPE_WEBHOOK_SECRET` (required): endpoint signing secret (`whsec_...`)
//! - `STRIPE_WEBHOOK_TOLERANCE_SECS`: replay window in seconds (default: 300)
//! - `STRIPE_WEBHOOK_ENABLE_IP_VALIDATION`: "true" to enforce the allow list (default: false)
//! - `STRIPE_WEBHOOK_TRUSTED_IPS`: comma-separated source IPs
//! - `STRIPE_WEBHOOK_ENABLE_SIGNATURE_VALIDATION`: "false" to skip the HMAC check (default: true)
//! - `STRIPE_WEBHOOK_RETRY_MAX_ATTEMPTS` (default: 3)
//! - `STRIPE_WEBHOOK_RETRY_BASE_DELAY_MS` (default: 1000)
//! - `STRIPE_WEBHOOK_RETRY_MAX_DELAY_MS` (default: 60000)
//! - `STRIPE_WEBHOOK_RETRY_BACKOFF_MULTIPLIER` (default: 2)
//! - `STRIPE_WEBHOOK_IDEMPOTENCY_TTL_SECS` (default: 86400)
//! - `STRIPE_WEBHOOK_IDEMPOTENCY_MAX_ENTRIES` (default: 100000)
//! - `STRIPE_WEBHOOK_DEAD_LETTER_TTL_SECS` (default: 604800)
//! - `STRIPE_WEBHOOK_DEAD_LETTER_MAX_ENTRIES` (default: 10000)
//! - `STRIPE_WEBHOOK_LOG_PAYLOADS`: log raw payloads at debug (default: false)

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::stripe::retry::RetryConfig;

/// Default replay window, matching the provider SDK
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Security settings for the webhook endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityConfig {
    /// Replay-protection bound in seconds
    pub tolerance_window: i64,
    /// Reject requests whose source IP is not in `trusted_ips`
    pub enable_ip_validation: bool,
    /// Allowed source addresses
    pub trusted_ips: HashSet<IpAddr>,
    /// Verify the HMAC signature (disable only for local development)
    pub enable_signature_validation: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            tolerance_window: DEFAULT_TOLERANCE_SECS,
            // Stripe doesn't publish a stable IP set for every region
            enable_ip_validation: false,
            trusted_ips: HashSet::new(),
            enable_signature_validation: true,
        }
    }
}

/// Complete configuration for the webhook service
#[derive(Clone)]
pub struct StripeWebhookConfig {
    /// Endpoint signing secret
    pub webhook_secret: String,
    /// Header carrying the signature
    pub signature_header: String,
    pub security: SecurityConfig,
    pub retry: RetryConfig,
    /// How long processed event IDs are remembered
    pub idempotency_ttl: Duration,
    /// Upper bound on remembered event IDs
    pub idempotency_max_entries: usize,
    /// How long a failed event stays available for manual retry
    pub dead_letter_ttl: Duration,
    /// Upper bound on failed events held for manual retry
    pub dead_letter_max_entries: usize,
    /// Log raw payloads at debug level (DISABLE in production, PII)
    pub log_payloads: bool,
}

impl fmt::Debug for StripeWebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripeWebhookConfig")
            .field("webhook_secret", &"[REDACTED]")
            .field("signature_header", &self.signature_header)
            .field("security", &self.security)
            .field("retry", &self.retry)
            .field("idempotency_ttl", &self.idempotency_ttl)
            .field("idempotency_max_entries", &self.idempotency_max_entries)
            .field("dead_letter_ttl", &self.dead_letter_ttl)
            .field("dead_letter_max_entries", &self.dead_letter_max_entries)
            .field("log_payloads", &self.log_payloads)
            .finish()
    }
}

impl StripeWebhookConfig {
    /// Create a configuration with defaults around the given secret
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            signature_header: "stripe-signature".to_string(),
            security: SecurityConfig::default(),
            retry: RetryConfig::default(),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            idempotency_max_entries: 100_000,
            dead_letter_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            dead_letter_max_entries: 10_000,
            log_payloads: false,
        }
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = lookup("STRIPE_WEBHOOK_SECRET")
            .ok_or_else(|| Error::Config("STRIPE_WEBHOOK_SECRET is not set".to_string()))?;
        if secret.trim().is_empty() {
            return Err(Error::Config(
                "STRIPE_WEBHOOK_SECRET cannot be empty".to_string(),
            ));
        }
        if !secret.starts_with("whsec_") {
            tracing::warn!("STRIPE_WEBHOOK_SECRET does not look like a Stripe signing secret");
        }

        let mut config = Self::new(secret);

        let tolerance: i64 = parse_var(&lookup, "STRIPE_WEBHOOK_TOLERANCE_SECS")?
            .unwrap_or(DEFAULT_TOLERANCE_SECS);
        if tolerance <= 0 {
            return Err(Error::Config(
                "STRIPE_WEBHOOK_TOLERANCE_SECS must be positive".to_string(),
            ));
        }
        config.security.tolerance_window = tolerance;

        config.security.enable_ip_validation =
            parse_bool(&lookup, "STRIPE_WEBHOOK_ENABLE_IP_VALIDATION")?.unwrap_or(false);
        config.security.enable_signature_validation =
            parse_bool(&lookup, "STRIPE_WEBHOOK_ENABLE_SIGNATURE_VALIDATION")?.unwrap_or(true);

        if let Some(list) = lookup("STRIPE_WEBHOOK_TRUSTED_IPS") {
            config.security.trusted_ips = parse_ip_list(&list)?;
        }

        if config.security.enable_ip_validation && config.security.trusted_ips.is_empty() {
            tracing::warn!("IP validation enabled with an empty allow list; every delivery will be rejected");
        }
        if !config.security.enable_signature_validation {
            tracing::warn!("SECURITY: webhook signature validation is DISABLED");
        }

        let defaults = RetryConfig::default();
        config.retry = RetryConfig {
            max_attempts: parse_var(&lookup, "STRIPE_WEBHOOK_RETRY_MAX_ATTEMPTS")?
                .unwrap_or(defaults.max_attempts),
            base_delay: parse_var(&lookup, "STRIPE_WEBHOOK_RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: parse_var(&lookup, "STRIPE_WEBHOOK_RETRY_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            backoff_multiplier: parse_var(&lookup, "STRIPE_WEBHOOK_RETRY_BACKOFF_MULTIPLIER")?
                .unwrap_or(defaults.backoff_multiplier),
        };
        config.retry.validate().map_err(Error::Config)?;

        if let Some(ttl) = parse_var::<u64, _>(&lookup, "STRIPE_WEBHOOK_IDEMPOTENCY_TTL_SECS")? {
            config.idempotency_ttl = Duration::from_secs(ttl);
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, "STRIPE_WEBHOOK_IDEMPOTENCY_MAX_ENTRIES")? {
            if max == 0 {
                return Err(Error::Config(
                    "STRIPE_WEBHOOK_IDEMPOTENCY_MAX_ENTRIES must be at least 1".to_string(),
                ));
            }
            config.idempotency_max_entries = max;
        }

        if let Some(ttl) = parse_var::<u64, _>(&lookup, "STRIPE_WEBHOOK_DEAD_LETTER_TTL_SECS")? {
            config.dead_letter_ttl = Duration::from_secs(ttl);
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, "STRIPE_WEBHOOK_DEAD_LETTER_MAX_ENTRIES")? {
            if max == 0 {
                return Err(Error::Config(
                    "STRIPE_WEBHOOK_DEAD_LETTER_MAX_ENTRIES must be at least 1".to_string(),
                ));
            }
            config.dead_letter_max_entries = max;
        }

        config.log_payloads = parse_bool(&lookup, "STRIPE_WEBHOOK_LOG_PAYLOADS")?.unwrap_or(false);

        tracing::info!(
            tolerance_secs = config.security.tolerance_window,
            ip_validation = config.security.enable_ip_validation,
            trusted_ips = config.security.trusted_ips.len(),
            max_attempts = config.retry.max_attempts,
            "Loaded webhook configuration"
        );

        Ok(config)
    }

    /// Create a test configuration (for testing only)
    #[doc(hidden)]
    pub fn test_config() -> Self {
        let mut config = Self::new("whsec_test_secret_for_unit_tests");
        config.retry = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        };
        config.idempotency_max_entries = 1000;
        config
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}: invalid value {:?}: {}", key, raw, e))),
    }
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(Error::Config(format!("{}: expected a boolean, got {:?}", key, raw))),
        },
    }
}

fn parse_ip_list(list: &str) -> Result<HashSet<IpAddr>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|e| Error::Config(format!("STRIPE_WEBHOOK_TRUSTED_IPS: {:?}: {}", s, e)))
        })
        .collect()
}
