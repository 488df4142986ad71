//! Event structure validation, run after the signature check.

use std::sync::OnceLock;

use regex::Regex;

use crate::stripe::error::ValidationError;
use crate::stripe::events::WebhookEvent;

fn event_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^evt_[A-Za-z0-9_]+$").expect("static regex"))
}

/// Structural checks on a verified event. Pure: no I/O, no side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventValidator;

impl EventValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, event: &WebhookEvent) -> Result<(), ValidationError> {
        let mut missing = Vec::new();
        if event.id.is_empty() {
            missing.push("id");
        }
        if event.event_type.is_empty() {
            missing.push("type");
        }
        if event.data.is_none() {
            missing.push("data");
        }
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields(missing.join(", ")));
        }

        if !event_id_pattern().is_match(&event.id) {
            return Err(ValidationError::MalformedId(event.id.clone()));
        }

        if event.created <= 0 {
            return Err(ValidationError::InvalidTimestamp(event.created));
        }

        Ok(())
    }
}
