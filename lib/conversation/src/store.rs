//! Message store: append-only, ordered history per conversation.
//!
//! The store is the only component that mutates history. It does not
//! serialize concurrent writers itself; callers hold a per-conversation lock
//! so that positions stay gapless. The sequence checks here catch a caller
//! that skipped the lock.

use crate::error::StoreError;
use crate::message::{Message, MessageRole, NewMessage};
use async_trait::async_trait;
use parley_core::ConversationId;
use rootcause::Report;
use std::collections::HashMap;
use std::sync::RwLock;

/// Trait for message history storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message at the next sequence position.
    ///
    /// Returns the stored message, including its assigned position.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidSequence` if the message would break the
    /// sequence invariants, or a storage error if persisting fails.
    async fn append(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, Report<StoreError>>;

    /// Returns history oldest-first.
    ///
    /// With a `limit`, only the most recent `limit` messages are returned,
    /// still oldest-first. Unknown conversations have an empty history.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be read.
    async fn history(
        &self,
        conversation_id: &ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, Report<StoreError>>;
}

/// Checks that `message` may be appended at `next_position`.
pub(crate) fn check_append(
    conversation_id: &ConversationId,
    next_position: u64,
    message: &NewMessage,
) -> Result<(), StoreError> {
    let violation = |reason: String| StoreError::InvalidSequence {
        conversation_id: conversation_id.clone(),
        next_position,
        reason,
    };

    if let Some(expected) = message.expected_position
        && expected != next_position
    {
        return Err(violation(format!(
            "writer expected position {expected}"
        )));
    }

    if message.role == MessageRole::System && next_position != 0 {
        return Err(violation(
            "system message is only allowed at position 0".to_string(),
        ));
    }

    Ok(())
}

/// Returns the most recent `limit` messages, oldest-first.
pub(crate) fn tail(messages: &[Message], limit: Option<usize>) -> Vec<Message> {
    let start = limit.map_or(0, |limit| messages.len().saturating_sub(limit));
    messages[start..].to_vec()
}

/// Process-local message store.
///
/// History lives only as long as the process; suitable for tests and
/// single-instance deployments that accept losing history on restart.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    conversations: RwLock<HashMap<ConversationId, Vec<Message>>>,
}

impl InMemoryMessageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::StorageFailed {
        reason: "history lock poisoned".to_string(),
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, Report<StoreError>> {
        let mut conversations = self.conversations.write().map_err(|_| poisoned())?;
        let messages = conversations.entry(conversation_id.clone()).or_default();

        let next_position = messages.len() as u64;
        check_append(conversation_id, next_position, &message)?;

        let stored = Message::from_new(message, next_position);
        messages.push(stored.clone());

        tracing::trace!(
            conversation_id = %conversation_id,
            position = next_position,
            role = %stored.role,
            "Appended message"
        );

        Ok(stored)
    }

    async fn history(
        &self,
        conversation_id: &ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, Report<StoreError>> {
        let conversations = self.conversations.read().map_err(|_| poisoned())?;
        Ok(conversations
            .get(conversation_id)
            .map(|messages| tail(messages, limit))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(raw: &str) -> ConversationId {
        ConversationId::parse(raw).expect("valid id")
    }

    #[tokio::test]
    async fn positions_are_gapless_from_zero() {
        let store = InMemoryMessageStore::new();
        let id = conv("c1");

        let a = store.append(&id, NewMessage::user("Hello")).await.unwrap();
        let b = store.append(&id, NewMessage::assistant("Hi there")).await.unwrap();
        let c = store.append(&id, NewMessage::user("How are you?")).await.unwrap();

        assert_eq!((a.position, b.position, c.position), (0, 1, 2));

        let history = store.history(&id, None).await.unwrap();
        let positions: Vec<u64> = history.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(history[1].content, "Hi there");
    }

    #[tokio::test]
    async fn unknown_conversation_has_empty_history() {
        let store = InMemoryMessageStore::new();
        let history = store.history(&conv("nobody"), Some(5)).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn limit_returns_most_recent_oldest_first() {
        let store = InMemoryMessageStore::new();
        let id = conv("c1");
        for i in 0..5 {
            let msg = if i % 2 == 0 {
                NewMessage::user(format!("u{i}"))
            } else {
                NewMessage::assistant(format!("a{i}"))
            };
            store.append(&id, msg).await.unwrap();
        }

        let recent = store.history(&id, Some(2)).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a3", "u4"]);

        let all = store.history(&id, Some(50)).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(store.history(&id, Some(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let store = InMemoryMessageStore::new();
        store.append(&conv("a"), NewMessage::user("one")).await.unwrap();
        let b = store.append(&conv("b"), NewMessage::user("two")).await.unwrap();

        assert_eq!(b.position, 0);
        assert_eq!(store.history(&conv("a"), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn system_message_only_at_start() {
        let store = InMemoryMessageStore::new();
        let id = conv("c1");

        store
            .append(&id, NewMessage::system("Be brief."))
            .await
            .unwrap();
        store.append(&id, NewMessage::user("Hello")).await.unwrap();

        let err = store
            .append(&id, NewMessage::system("Late instructions"))
            .await
            .unwrap_err();
        assert!(err.current_context().is_invalid_sequence());
        assert_eq!(store.history(&id, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn expected_position_mismatch_is_rejected() {
        let store = InMemoryMessageStore::new();
        let id = conv("c1");
        store.append(&id, NewMessage::user("Hello")).await.unwrap();

        let err = store
            .append(&id, NewMessage::assistant("stale").at_position(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            StoreError::InvalidSequence { next_position: 1, .. }
        ));

        let ok = store
            .append(&id, NewMessage::assistant("fresh").at_position(1))
            .await
            .unwrap();
        assert_eq!(ok.position, 1);
    }
}
