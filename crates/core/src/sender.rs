//! MessageSender trait: the abstraction over delivery providers.
//!
//! A sender delivers an email through a provider or creates an in-app
//! direct-message record. It may fail transiently (retry next tick) or
//! permanently (recorded, flagged for review).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SendError;
use crate::sequence::StepChannel;

/// A message ready to hand to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub user_id: String,

    pub template_id: String,

    pub channel: StepChannel,

    /// Template variables (step variables merged with engine context)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(user_id: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            template_id: template_id.into(),
            channel: StepChannel::Email,
            variables: serde_json::Map::new(),
        }
    }

    pub fn with_channel(mut self, channel: StepChannel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }
}

/// Provider acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
}

/// The core MessageSender trait.
///
/// Implementations must not hold exclusive resources across the await; the
/// scheduler bounds every call with a timeout.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Human-readable sender name (e.g., "log", "webhook").
    fn name(&self) -> &str;

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_message_serialization() {
        let msg = OutboundMessage::new("u1", "welcome")
            .with_channel(StepChannel::DirectMessage)
            .with_variable("first_name", serde_json::json!("Ada"));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("direct_message"));
        assert!(json.contains("Ada"));
    }
}
