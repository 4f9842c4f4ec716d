//! WhatsApp Business channel.
//!
//! Inbound messages arrive through the Meta webhook and run as ordinary turns,
//! with the sender's phone number as the conversation ID. Replies go out
//! through the Graph API `/{phone_number_id}/messages` endpoint.

use crate::config::WhatsAppConfig;
use async_trait::async_trait;
use rootcause::Report;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Timeout for one Graph API request.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest slice of a Graph API error body kept in errors.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Errors delivering a reply to WhatsApp.
#[derive(Debug)]
pub enum DeliveryError {
    /// A required setting is missing.
    NotConfigured { setting: &'static str },
    /// The request did not complete.
    Network { reason: String },
    /// The Graph API answered with a non-success status.
    Rejected { status: u16, body: String },
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured { setting } => write!(f, "whatsapp.{setting} is not set"),
            Self::Network { reason } => write!(f, "cannot reach the Graph API: {reason}"),
            Self::Rejected { status, body } => {
                write!(f, "Graph API rejected the message (HTTP {status}): {body}")
            }
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Outbound text messages.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sends `body` to the phone number `to`.
    async fn send_text(&self, to: &str, body: &str) -> Result<(), Report<DeliveryError>>;
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    text: OutboundText<'a>,
}

#[derive(Debug, Serialize)]
struct OutboundText<'a> {
    body: &'a str,
}

impl<'a> OutboundMessage<'a> {
    fn text(to: &'a str, body: &'a str) -> Self {
        Self {
            messaging_product: "whatsapp",
            to,
            kind: "text",
            text: OutboundText { body },
        }
    }
}

/// [`MessageSender`] backed by the Graph API.
#[derive(Debug, Clone)]
pub struct GraphApiSender {
    client: reqwest::Client,
    messages_url: String,
    access_token: String,
}

impl GraphApiSender {
    /// Creates a sender from the channel configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the access token or phone number ID is missing, or
    /// the HTTP client cannot be built.
    pub fn new(config: &WhatsAppConfig) -> Result<Self, DeliveryError> {
        let access_token = config
            .access_token()
            .ok_or(DeliveryError::NotConfigured {
                setting: "access_token",
            })?
            .to_string();
        let messages_url = config.messages_url().ok_or(DeliveryError::NotConfigured {
            setting: "phone_number_id",
        })?;

        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| DeliveryError::Network {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            messages_url,
            access_token,
        })
    }

    /// The Graph API endpoint messages are posted to.
    #[must_use]
    pub fn messages_url(&self) -> &str {
        &self.messages_url
    }
}

#[async_trait]
impl MessageSender for GraphApiSender {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), Report<DeliveryError>> {
        let response = self
            .client
            .post(&self.messages_url)
            .bearer_auth(&self.access_token)
            .json(&OutboundMessage::text(to, body))
            .send()
            .await
            .map_err(|e| DeliveryError::Network {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            }
            .into());
        }

        tracing::debug!(status = status.as_u16(), "Graph API accepted message");
        Ok(())
    }
}

/// The webhook side of the channel: verification and reply delivery.
#[derive(Clone)]
pub struct WhatsAppChannel {
    verify_token: String,
    sender: Arc<dyn MessageSender>,
}

impl fmt::Debug for WhatsAppChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhatsAppChannel").finish_non_exhaustive()
    }
}

impl WhatsAppChannel {
    #[must_use]
    pub fn new(verify_token: impl Into<String>, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            verify_token: verify_token.into(),
            sender,
        }
    }

    /// Answers a subscription handshake: the challenge is echoed back only
    /// for mode `subscribe` with the configured token.
    #[must_use]
    pub fn verify(
        &self,
        mode: Option<&str>,
        token: Option<&str>,
        challenge: Option<String>,
    ) -> Option<String> {
        if mode == Some("subscribe") && token == Some(self.verify_token.as_str()) {
            challenge
        } else {
            None
        }
    }

    #[must_use]
    pub fn sender(&self) -> &dyn MessageSender {
        self.sender.as_ref()
    }
}

/// Query of the subscription handshake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode", default)]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token", default)]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge", default)]
    pub challenge: Option<String>,
}

/// Webhook notification body. Only the parts used for text turns are read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub value: WebhookValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookValue {
    /// Absent on delivery-status notifications.
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    /// Sender phone number, digits only.
    pub from: String,
    /// WhatsApp message ID (`wamid...`).
    #[serde(default)]
    pub id: Option<String>,
    /// Present for text messages only.
    #[serde(default)]
    pub text: Option<InboundText>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundText {
    pub body: String,
}

impl WebhookPayload {
    /// The first message of the first change, if any.
    #[must_use]
    pub fn first_message(&self) -> Option<&InboundMessage> {
        self.entry
            .first()?
            .changes
            .first()?
            .value
            .messages
            .first()
    }
}
