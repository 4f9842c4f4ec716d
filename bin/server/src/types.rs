//! Request and response bodies.

use parley_conversation::Message;
use serde::{Deserialize, Serialize};

/// Body of `POST /chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// Existing conversation; a new one is started when absent.
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
    /// Caller-chosen ID, stored with the user message.
    #[serde(default)]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub reply: String,
}

/// Body of `POST /responder`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponderRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderResponse {
    pub response: String,
    pub conversation_id: String,
}

/// Query of `GET /conversations/{id}/messages`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    /// Most recent messages to return.
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

/// Error envelope for every failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub error: String,
    pub message: String,
    /// Whether sending the same request later may succeed.
    pub retryable: bool,
}

/// Acknowledgement returned to webhook notifications.
///
/// Failed turns are acknowledged too, so Meta does not redeliver the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAck {
    /// `ok`, `ignored` or `error`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookAck {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            error: None,
        }
    }

    #[must_use]
    pub fn ignored() -> Self {
        Self {
            status: "ignored".to_string(),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(code: &str) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(code.to_string()),
        }
    }
}
