//! Log sender: writes each message to the log and keeps it in an outbox.
//!
//! The default sender for local runs and dry runs.

use async_trait::async_trait;
use coachflow_core::error::SendError;
use coachflow_core::sender::{MessageSender, OutboundMessage, SendReceipt};
use tokio::sync::Mutex;
use tracing::info;

/// Cap on retained outbox entries; older ones are dropped first.
const OUTBOX_CAPACITY: usize = 1000;

#[derive(Default)]
pub struct LogSender {
    outbox: Mutex<Vec<OutboundMessage>>,
}

impl LogSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages "sent" so far, oldest first.
    pub async fn outbox(&self) -> Vec<OutboundMessage> {
        self.outbox.lock().await.clone()
    }
}

#[async_trait]
impl MessageSender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        info!(
            user_id = %message.user_id,
            template = %message.template_id,
            channel = %message.channel,
            variables = %serde_json::Value::Object(message.variables.clone()),
            "Message sent (log)"
        );

        let mut outbox = self.outbox.lock().await;
        if outbox.len() >= OUTBOX_CAPACITY {
            outbox.remove(0);
        }
        outbox.push(message.clone());

        Ok(SendReceipt {
            provider_message_id: Some(format!("log-{}", outbox.len())),
        })
    }
}
