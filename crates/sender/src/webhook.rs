//! Webhook sender: POSTs each message as JSON to an email/DM provider.
//!
//! Status mapping:
//! - 2xx → delivered
//! - 429, 5xx, connection errors, timeouts → transient (retried next tick)
//! - any other 4xx → permanent (bad recipient, unknown template)

use async_trait::async_trait;
use chrono::Utc;
use coachflow_core::error::SendError;
use coachflow_core::sender::{MessageSender, OutboundMessage, SendReceipt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::signature::{SIGNATURE_HEADER, sign};

/// Body posted to the provider.
#[derive(Debug, Serialize)]
struct Payload<'a> {
    #[serde(flatten)]
    message: &'a OutboundMessage,
    sent_at: chrono::DateTime<Utc>,
}

/// Fields we read from a successful provider response, if present.
#[derive(Debug, Default, Deserialize)]
struct ProviderAck {
    #[serde(default, alias = "message_id")]
    id: Option<String>,
}

pub struct WebhookSender {
    url: String,
    api_key: Option<String>,
    signing_secret: Option<String>,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        signing_secret: Option<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::Permanent(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            signing_secret: signing_secret.filter(|s| !s.is_empty()),
            client,
        })
    }
}

#[async_trait]
impl MessageSender for WebhookSender {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        let body = serde_json::to_vec(&Payload {
            message,
            sent_at: Utc::now(),
        })
        .map_err(|e| SendError::Permanent(format!("Unserializable message: {e}")))?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(secret) = &self.signing_secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, &body));
        }

        debug!(user_id = %message.user_id, template = %message.template_id, "Posting to provider");

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                SendError::Transient(format!("Provider timed out: {e}"))
            } else {
                SendError::Transient(format!("Network error: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            let ack: ProviderAck = response.json().await.unwrap_or_default();
            return Ok(SendReceipt {
                provider_message_id: ack.id,
            });
        }

        let error_body = response.text().await.unwrap_or_default();
        warn!(status, body = %error_body, user_id = %message.user_id, "Provider returned error");

        if status == 429 || status >= 500 {
            Err(SendError::Transient(format!("Provider returned {status}: {error_body}")))
        } else {
            Err(SendError::Permanent(format!("Provider returned {status}: {error_body}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::verify;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Seen {
        bodies: Mutex<Vec<(HeaderMap, Vec<u8>)>>,
    }

    /// Serve `status` + `body` on an ephemeral port; returns the URL.
    async fn provider(status: StatusCode, body: &'static str, seen: Arc<Seen>) -> String {
        let app = Router::new().route(
            "/send",
            post(move |headers: HeaderMap, bytes: axum::body::Bytes| {
                let seen = seen.clone();
                async move {
                    seen.bodies.lock().unwrap().push((headers, bytes.to_vec()));
                    (status, body)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/send")
    }

    fn sender(url: String) -> WebhookSender {
        WebhookSender::new(
            url,
            Some("key-123".into()),
            Some("sign-me".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn message() -> OutboundMessage {
        OutboundMessage::new("u1", "welcome").with_variable("first_name", serde_json::json!("Ada"))
    }

    #[tokio::test]
    async fn success_returns_provider_id() {
        let seen = Arc::new(Seen::default());
        let url = provider(StatusCode::OK, r#"{"id":"msg-42"}"#, seen.clone()).await;

        let receipt = sender(url).send(&message()).await.unwrap();
        assert_eq!(receipt.provider_message_id.as_deref(), Some("msg-42"));

        let bodies = seen.bodies.lock().unwrap();
        let (headers, body) = &bodies[0];
        assert_eq!(headers["authorization"], "Bearer key-123");
        let sig = headers[SIGNATURE_HEADER].to_str().unwrap();
        assert!(verify("sign-me", body, sig));

        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["template_id"], "welcome");
        assert_eq!(json["variables"]["first_name"], "Ada");
        assert!(json["sent_at"].is_string());
    }

    #[tokio::test]
    async fn non_json_success_is_still_success() {
        let url = provider(StatusCode::ACCEPTED, "queued", Arc::default()).await;
        let receipt = sender(url).send(&message()).await.unwrap();
        assert!(receipt.provider_message_id.is_none());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        for status in [StatusCode::SERVICE_UNAVAILABLE, StatusCode::TOO_MANY_REQUESTS] {
            let url = provider(status, "busy", Arc::default()).await;
            let err = sender(url).send(&message()).await.unwrap_err();
            assert!(err.is_transient(), "{status} should be transient");
        }
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let url = provider(StatusCode::UNPROCESSABLE_ENTITY, "invalid recipient", Arc::default()).await;
        let err = sender(url).send(&message()).await.unwrap_err();
        assert!(matches!(err, SendError::Permanent(ref m) if m.contains("invalid recipient")));
    }

    #[tokio::test]
    async fn unreachable_provider_is_transient() {
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = sender(format!("http://{addr}/send"))
            .send(&message())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
