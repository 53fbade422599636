// =============================================================================
// Published channel names and event payloads
// =============================================================================
//
// Everything published is JSON-encoded UTF-8, one message per publish.
// Consumers correlate across accounts using `instrument_token` plus the
// broker timestamp carried in each payload.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Fully-qualified channel names under one configurable prefix.
#[derive(Debug, Clone)]
pub struct Channels {
    pub underlying: String,
    pub options: String,
    pub events: String,
}

impl Channels {
    pub fn new(prefix: &str) -> Self {
        Self {
            underlying: format!("ticker:{prefix}:underlying"),
            options: format!("ticker:{prefix}:options"),
            events: format!("ticker:{prefix}:events"),
        }
    }
}

/// Subscription lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEventType {
    SubscriptionCreated,
    SubscriptionRemoved,
    SubscriptionReassigned,
}

/// Lifecycle event published on the events channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub event_type: SubscriptionEventType,
    pub instrument_token: u32,
    pub metadata: serde_json::Value,
    pub timestamp_ms: i64,
}

impl SubscriptionEvent {
    pub fn now(
        event_type: SubscriptionEventType,
        instrument_token: u32,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            instrument_token,
            metadata,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_carry_the_prefix() {
        let ch = Channels::new("vega");
        assert_eq!(ch.underlying, "ticker:vega:underlying");
        assert_eq!(ch.options, "ticker:vega:options");
        assert_eq!(ch.events, "ticker:vega:events");
    }

    #[test]
    fn event_serializes_snake_case() {
        let ev = SubscriptionEvent {
            event_type: SubscriptionEventType::SubscriptionReassigned,
            instrument_token: 42,
            metadata: serde_json::json!({"from": "primary", "to": "secondary"}),
            timestamp_ms: 1_763_960_400_000,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"subscription_reassigned\""));
        let back: SubscriptionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instrument_token, 42);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
}
