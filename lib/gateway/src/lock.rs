//! Per-conversation locks.
//!
//! Turns on the same conversation run one at a time; turns on different
//! conversations never wait on each other. Entries are dropped from the
//! registry when the last holder or queued waiter goes away.

use parley_core::ConversationId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Registry = Arc<Mutex<HashMap<ConversationId, Arc<AsyncMutex<()>>>>>;

/// Registry of per-conversation async mutexes.
#[derive(Debug, Clone, Default)]
pub struct ConversationLocks {
    registry: Registry,
}

impl ConversationLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `conversation_id`.
    ///
    /// Cancelling the returned future while it waits gives up the place in
    /// the queue and prunes the entry if nobody else uses it.
    pub async fn acquire(&self, conversation_id: &ConversationId) -> ConversationGuard {
        let lock = {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            registry
                .entry(conversation_id.clone())
                .or_default()
                .clone()
        };

        let mut waiting = Waiting {
            conversation_id,
            registry: &self.registry,
            done: false,
        };
        let guard = lock.lock_owned().await;
        waiting.done = true;

        ConversationGuard {
            conversation_id: conversation_id.clone(),
            registry: Arc::clone(&self.registry),
            guard: Some(guard),
        }
    }

    /// Number of conversations with a live lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Returns true if no conversation is locked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one conversation; released on drop.
#[derive(Debug)]
pub struct ConversationGuard {
    conversation_id: ConversationId,
    registry: Registry,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ConversationGuard {
    /// The locked conversation.
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        self.guard.take();
        prune(&self.registry, &self.conversation_id);
    }
}

/// Prunes the entry of a waiter that was dropped before it got the lock.
struct Waiting<'a> {
    conversation_id: &'a ConversationId,
    registry: &'a Registry,
    done: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if !self.done {
            prune(self.registry, self.conversation_id);
        }
    }
}

/// Removes the entry once the registry holds the only reference; holders and
/// queued waiters each keep one.
fn prune(registry: &Registry, conversation_id: &ConversationId) {
    let mut registry = registry
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(lock) = registry.get(conversation_id)
        && Arc::strong_count(lock) == 1
    {
        registry.remove(conversation_id);
    }
}
