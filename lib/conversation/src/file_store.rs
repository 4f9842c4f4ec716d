//! JSON-lines message store.
//!
//! Each conversation is kept in `<directory>/<conversation-id>.jsonl`, one
//! serialized [`Message`] per line. Appends are flushed and synced before
//! returning, so an acknowledged user turn survives a crash. Files are read
//! once, on first access, and then served from memory. Reading a conversation
//! that has no file caches nothing. A failed append truncates the file back
//! to its last complete line and re-reads it on next access.

use crate::error::StoreError;
use crate::message::{Message, NewMessage};
use crate::store::{MessageStore, check_append, tail};
use async_trait::async_trait;
use parley_core::ConversationId;
use rootcause::Report;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

/// Cached contents of one conversation file.
#[derive(Debug, Default)]
struct ConversationLog {
    loaded: bool,
    messages: Vec<Message>,
}

/// File-backed message store.
#[derive(Debug)]
pub struct JsonlMessageStore {
    directory: PathBuf,
    logs: Mutex<HashMap<ConversationId, Arc<AsyncMutex<ConversationLog>>>>,
    #[cfg(test)]
    fail_next_sync: std::sync::atomic::AtomicBool,
}

impl JsonlMessageStore {
    /// Opens a store rooted at `directory`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, Report<StoreError>> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| StoreError::StorageFailed {
                reason: format!("cannot create {}: {e}", directory.display()),
            })?;

        tracing::info!(directory = %directory.display(), "Opened JSONL message store");

        Ok(Self {
            directory,
            logs: Mutex::new(HashMap::new()),
            #[cfg(test)]
            fail_next_sync: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Returns the directory holding conversation files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, conversation_id: &ConversationId) -> PathBuf {
        self.directory
            .join(format!("{}.jsonl", conversation_id.as_str()))
    }

    fn logs(
        &self,
    ) -> Result<
        std::sync::MutexGuard<'_, HashMap<ConversationId, Arc<AsyncMutex<ConversationLog>>>>,
        StoreError,
    > {
        self.logs.lock().map_err(|_| StoreError::StorageFailed {
            reason: "log registry lock poisoned".to_string(),
        })
    }

    fn log_for(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Arc<AsyncMutex<ConversationLog>>, StoreError> {
        Ok(self
            .logs()?
            .entry(conversation_id.clone())
            .or_default()
            .clone())
    }

    /// The cached log for a conversation that has one or has a file on disk.
    async fn existing_log(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Arc<AsyncMutex<ConversationLog>>>, StoreError> {
        if let Some(log) = self.logs()?.get(conversation_id) {
            return Ok(Some(Arc::clone(log)));
        }

        let path = self.path_for(conversation_id);
        let exists =
            tokio::fs::try_exists(&path)
                .await
                .map_err(|e| StoreError::StorageFailed {
                    reason: format!("cannot stat {}: {e}", path.display()),
                })?;
        if exists {
            self.log_for(conversation_id).map(Some)
        } else {
            Ok(None)
        }
    }

    async fn load(
        &self,
        conversation_id: &ConversationId,
        log: &mut ConversationLog,
    ) -> Result<(), Report<StoreError>> {
        if log.loaded {
            return Ok(());
        }

        let path = self.path_for(conversation_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(StoreError::StorageFailed {
                    reason: format!("cannot read {}: {e}", path.display()),
                }
                .into());
            }
        };

        let mut messages = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let message: Message =
                serde_json::from_str(line).map_err(|e| StoreError::Corrupted {
                    conversation_id: conversation_id.clone(),
                    line: index + 1,
                    reason: e.to_string(),
                })?;
            if message.position != messages.len() as u64 {
                return Err(StoreError::Corrupted {
                    conversation_id: conversation_id.clone(),
                    line: index + 1,
                    reason: format!(
                        "position {} where {} was expected",
                        message.position,
                        messages.len()
                    ),
                }
                .into());
            }
            messages.push(message);
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            messages = messages.len(),
            "Loaded conversation history from disk"
        );

        log.messages = messages;
        log.loaded = true;
        Ok(())
    }

    /// Appends one line, truncating back to the previous length on failure.
    async fn write_line(&self, path: &Path, message: &Message) -> Result<(), StoreError> {
        let failed = |e: std::io::Error| StoreError::StorageFailed {
            reason: format!("cannot append to {}: {e}", path.display()),
        };

        let mut line = serde_json::to_string(message).map_err(|e| StoreError::StorageFailed {
            reason: format!("cannot serialize message: {e}"),
        })?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(failed)?;
        let committed = file.metadata().await.map_err(failed)?.len();

        if let Err(e) = self.write_synced(&mut file, line.as_bytes()).await {
            if let Err(truncate) = file.set_len(committed).await {
                tracing::error!(
                    path = %path.display(),
                    error = %truncate,
                    "Cannot roll back partial append"
                );
            }
            return Err(failed(e));
        }
        Ok(())
    }

    async fn write_synced(
        &self,
        file: &mut tokio::fs::File,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        file.write_all(bytes).await?;
        file.flush().await?;
        #[cfg(test)]
        self.injected_sync_failure()?;
        file.sync_data().await
    }

    #[cfg(test)]
    fn injected_sync_failure(&self) -> std::io::Result<()> {
        if self
            .fail_next_sync
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            Err(std::io::Error::other("sync failed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageStore for JsonlMessageStore {
    async fn append(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, Report<StoreError>> {
        let log = self.log_for(conversation_id)?;
        let mut log = log.lock().await;
        self.load(conversation_id, &mut log).await?;

        let next_position = log.messages.len() as u64;
        check_append(conversation_id, next_position, &message)?;

        let stored = Message::from_new(message, next_position);
        if let Err(e) = self.write_line(&self.path_for(conversation_id), &stored).await {
            log.loaded = false;
            return Err(e.into());
        }
        log.messages.push(stored.clone());

        Ok(stored)
    }

    async fn history(
        &self,
        conversation_id: &ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, Report<StoreError>> {
        let Some(log) = self.existing_log(conversation_id).await? else {
            return Ok(Vec::new());
        };
        let mut log = log.lock().await;
        self.load(conversation_id, &mut log).await?;
        Ok(tail(&log.messages, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageRole;

    fn conv(raw: &str) -> ConversationId {
        ConversationId::parse(raw).expect("valid id")
    }

    #[tokio::test]
    async fn appends_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = conv("5491122334455");

        {
            let store = JsonlMessageStore::open(dir.path()).await.unwrap();
            store.append(&id, NewMessage::user("Hello")).await.unwrap();
            store
                .append(&id, NewMessage::assistant("Hi there"))
                .await
                .unwrap();
        }

        let reopened = JsonlMessageStore::open(dir.path()).await.unwrap();
        let history = reopened.history(&id, None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].content, "Hi there");

        let next = reopened
            .append(&id, NewMessage::user("How are you?"))
            .await
            .unwrap();
        assert_eq!(next.position, 2);
    }

    #[tokio::test]
    async fn unknown_conversation_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::open(dir.path()).await.unwrap();

        assert!(store.history(&conv("ghost"), None).await.unwrap().is_empty());
        assert!(!dir.path().join("ghost.jsonl").exists());
    }

    #[tokio::test]
    async fn one_file_per_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::open(dir.path()).await.unwrap();

        store.append(&conv("a"), NewMessage::user("x")).await.unwrap();
        store.append(&conv("b"), NewMessage::user("y")).await.unwrap();
        store.append(&conv("b"), NewMessage::assistant("z")).await.unwrap();

        let b = std::fs::read_to_string(dir.path().join("b.jsonl")).unwrap();
        assert_eq!(b.lines().count(), 2);
        assert!(dir.path().join("a.jsonl").exists());
    }

    #[tokio::test]
    async fn corrupted_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c1.jsonl"), "{not json}\n").unwrap();

        let store = JsonlMessageStore::open(dir.path()).await.unwrap();
        let err = store.history(&conv("c1"), None).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            StoreError::Corrupted { line: 1, .. }
        ));
    }

    #[tokio::test]
    async fn sequence_checks_apply_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::open(dir.path()).await.unwrap();
        let id = conv("c1");

        store.append(&id, NewMessage::user("Hello")).await.unwrap();
        let err = store
            .append(&id, NewMessage::system("too late"))
            .await
            .unwrap_err();
        assert!(err.current_context().is_invalid_sequence());

        let on_disk = std::fs::read_to_string(dir.path().join("c1.jsonl")).unwrap();
        assert_eq!(on_disk.lines().count(), 1);
    }

    #[tokio::test]
    async fn reads_of_unknown_conversations_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::open(dir.path()).await.unwrap();

        for i in 0..100 {
            let history = store.history(&conv(&format!("ghost-{i}")), None).await;
            assert!(history.unwrap().is_empty());
        }
        assert!(store.logs.lock().unwrap().is_empty());

        store.append(&conv("c1"), NewMessage::user("Hello")).await.unwrap();
        assert_eq!(store.logs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn existing_file_is_read_without_prior_append() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonlMessageStore::open(dir.path()).await.unwrap();
            store.append(&conv("c1"), NewMessage::user("Hello")).await.unwrap();
        }

        let reopened = JsonlMessageStore::open(dir.path()).await.unwrap();
        let history = reopened.history(&conv("c1"), None).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn failed_sync_rolls_back_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::open(dir.path()).await.unwrap();
        let id = conv("c1");
        store.append(&id, NewMessage::user("Hello")).await.unwrap();

        store
            .fail_next_sync
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = store
            .append(&id, NewMessage::assistant("lost"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            StoreError::StorageFailed { .. }
        ));
        let on_disk = std::fs::read_to_string(dir.path().join("c1.jsonl")).unwrap();
        assert_eq!(on_disk.lines().count(), 1);

        let retried = store
            .append(&id, NewMessage::assistant("Hi there"))
            .await
            .unwrap();
        assert_eq!(retried.position, 1);

        let reopened = JsonlMessageStore::open(dir.path()).await.unwrap();
        let history = reopened.history(&id, None).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hello", "Hi there"]);
    }
}
