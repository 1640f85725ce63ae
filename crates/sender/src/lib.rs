//! Message senders for Coachflow.
//!
//! - [`LogSender`]: logs and keeps an outbox; no network
//! - [`WebhookSender`]: POSTs to an HTTP email/DM provider

pub mod log;
pub mod signature;
pub mod webhook;

pub use log::LogSender;
pub use webhook::WebhookSender;

use coachflow_config::SenderConfig;
use coachflow_core::error::SendError;
use coachflow_core::sender::MessageSender;
use std::sync::Arc;
use std::time::Duration;

/// Build the sender selected by `[sender]`.
///
/// `timeout` bounds the HTTP call; the scheduler applies its own bound on top.
pub fn build_from_config(
    config: &SenderConfig,
    timeout: Duration,
) -> Result<Arc<dyn MessageSender>, SendError> {
    match config.kind.as_str() {
        "log" => Ok(Arc::new(LogSender::new())),
        "webhook" => {
            let url = config
                .webhook_url
                .clone()
                .ok_or_else(|| SendError::Permanent("sender.webhook_url is required".into()))?;
            Ok(Arc::new(WebhookSender::new(
                url,
                config.api_key.clone(),
                config.signing_secret.clone(),
                timeout,
            )?))
        }
        other => Err(SendError::Permanent(format!("Unknown sender kind '{other}'"))),
    }
}
