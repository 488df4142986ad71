//! Property-based testing for retry backoff and signature verification.
//!
//! Uses proptest to generate retry configurations, payloads and headers and
//! verify the invariants the pipeline depends on.

use std::sync::Arc;
use std::time::Duration;

use parampara_webhooks::stripe::signature::{compute_signature, signature_header};
use parampara_webhooks::stripe::{
    InMemoryAuditLog, RetryConfig, SignatureHeader, SignatureVerifier, VerificationError,
};
use proptest::prelude::*;

// ============================================================================
// STRATEGIES
// ============================================================================

/// Strategy for generating valid retry configurations
pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
    (1u32..10, 1u64..5_000, 1.1f64..4.0, 0u64..120_000).prop_map(
        |(max_attempts, base_ms, multiplier, extra_ms)| RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(base_ms + extra_ms),
            backoff_multiplier: multiplier,
        },
    )
}

/// Strategy for generating webhook bodies (arbitrary bytes, mostly JSON-ish)
pub fn arb_body() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..512),
        "[ -~]{0,256}".prop_map(String::into_bytes),
    ]
}

const SECRET: &str = "whsec_proptest";
const NOW: i64 = 1_700_000_000;

fn verifier() -> SignatureVerifier {
    SignatureVerifier::new(SECRET, 300, Arc::new(InMemoryAuditLog::new()))
}

// ============================================================================
// BACKOFF PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn delay_never_exceeds_max(config in arb_retry_config(), attempt in 1u32..64) {
        prop_assert!(config.delay_for_attempt(attempt) <= config.max_delay);
    }

    #[test]
    fn first_delay_is_base(config in arb_retry_config()) {
        prop_assert_eq!(config.delay_for_attempt(1), config.base_delay);
    }

    #[test]
    fn delay_is_monotonic(config in arb_retry_config(), attempt in 1u32..63) {
        prop_assert!(config.delay_for_attempt(attempt) <= config.delay_for_attempt(attempt + 1));
    }

    #[test]
    fn generated_configs_validate(config in arb_retry_config()) {
        prop_assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_attempts_never_validate(mut config in arb_retry_config()) {
        config.max_attempts = 0;
        prop_assert!(config.validate().is_err());
    }
}

// ============================================================================
// SIGNATURE PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn signature_is_hex_sha256(body in arb_body(), ts in 0i64..4_000_000_000) {
        let sig = compute_signature(SECRET, ts, &body);
        prop_assert_eq!(sig.len(), 64);
        prop_assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn header_round_trips(body in arb_body(), ts in 0i64..4_000_000_000) {
        let header = signature_header(SECRET, ts, &body);
        let parsed = SignatureHeader::parse(&header).unwrap();
        prop_assert_eq!(parsed.timestamp, ts);
        prop_assert_eq!(parsed.signatures.len(), 1);
    }

    #[test]
    fn any_flipped_byte_fails_verification(
        body in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let header = signature_header(SECRET, NOW, &body);
        let mut tampered = body.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= 1 << bit;

        let result = verifier().construct_event(&tampered, Some(header.as_str()), NOW);
        prop_assert_eq!(result.unwrap_err(), VerificationError::SignatureMismatch);
    }

    #[test]
    fn header_outside_window_is_stale(body in arb_body(), skew in 301i64..100_000, future in any::<bool>()) {
        let ts = if future { NOW + skew } else { NOW - skew };
        let header = signature_header(SECRET, ts, &body);

        let result = verifier().construct_event(&body, Some(header.as_str()), NOW);
        let is_stale = matches!(result, Err(VerificationError::StaleTimestamp { .. }));
        prop_assert!(is_stale);
    }

    #[test]
    fn parser_never_panics(header in "[ -~]{0,200}") {
        let _ = SignatureHeader::parse(&header);
    }
}
