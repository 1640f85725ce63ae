//! Events: inbound user events and outbound automation notifications.
//!
//! [`Event`] is what producers (webhooks, lesson player, checkout) hand to
//! the rule engine. [`AutomationEvent`] is published on the [`EventBus`]
//! whenever the engine changes state, so other components can observe
//! without coupling to the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A user event entering the rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub user_id: String,

    /// Event kind, matched against rule triggers (e.g. "lesson_completed")
    pub trigger: String,

    #[serde(default)]
    pub payload: serde_json::Value,

    /// Producer-supplied idempotency key (e.g. webhook delivery id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,

    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        user_id: impl Into<String>,
        trigger: impl Into<String>,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            trigger: trigger.into(),
            payload,
            dedupe_key: None,
            occurred_at,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Resolve a dot-separated path in the payload (`lesson.id`).
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        path.split('.')
            .try_fold(&self.payload, |value, segment| match value {
                serde_json::Value::Object(map) => map.get(segment),
                serde_json::Value::Array(items) => {
                    segment.parse::<usize>().ok().and_then(|i| items.get(i))
                }
                _ => None,
            })
    }
}

/// Things the engine did, for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AutomationEvent {
    Enrolled {
        enrollment_id: String,
        user_id: String,
        sequence_id: String,
        timestamp: DateTime<Utc>,
    },

    StepDelivered {
        enrollment_id: String,
        step: u32,
        /// Found already delivered; only the enrollment moved on
        deduplicated: bool,
        timestamp: DateTime<Utc>,
    },

    DeliveryFailed {
        enrollment_id: String,
        step: u32,
        permanent: bool,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    EnrollmentCompleted {
        enrollment_id: String,
        timestamp: DateTime<Utc>,
    },

    EnrollmentExited {
        enrollment_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    RuleMatched {
        rule_id: String,
        user_id: String,
        trigger: String,
        timestamp: DateTime<Utc>,
    },

    TickCompleted {
        due: usize,
        sent: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for automation events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<AutomationEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: AutomationEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AutomationEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
