//! Message types for conversations.

use chrono::{DateTime, Utc};
use parley_core::MessageId;
use serde::{Deserialize, Serialize};

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// End-user message.
    User,
    /// Reply produced by the upstream model.
    Assistant,
    /// Instructions placed ahead of the conversation.
    System,
}

impl MessageRole {
    /// Returns the wire name of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted message in a conversation.
///
/// Messages are immutable once appended. `position` is assigned by the store
/// and is gapless within a conversation, starting at 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Sequence position within the conversation.
    pub position: u64,
    /// Message role.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
    /// When the message was appended.
    pub timestamp: DateTime<Utc>,
    /// Caller-generated ID of the submission that produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

impl Message {
    /// Materializes a new message at the given position.
    #[must_use]
    pub fn from_new(message: NewMessage, position: u64) -> Self {
        Self {
            id: MessageId::new(),
            position,
            role: message.role,
            content: message.content,
            timestamp: Utc::now(),
            client_message_id: message.client_message_id,
        }
    }
}

/// A message that has not been appended yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Message role.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
    /// Caller-generated submission ID, if any.
    pub client_message_id: Option<String>,
    /// Position the writer expects this message to land at.
    ///
    /// When set, the store refuses the append if the next free position
    /// differs.
    pub expected_position: Option<u64>,
}

impl NewMessage {
    /// Creates a new message with the given role.
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            client_message_id: None,
            expected_position: None,
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Attaches the caller's submission ID.
    #[must_use]
    pub fn with_client_message_id(mut self, id: Option<String>) -> Self {
        self.client_message_id = id;
        self
    }

    /// Requires the message to land at `position`.
    #[must_use]
    pub fn at_position(mut self, position: u64) -> Self {
        self.expected_position = Some(position);
        self
    }
}
