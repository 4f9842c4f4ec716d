//! Conversation orchestrator.
//!
//! Runs one turn end to end:
//! 1. Validate the user text
//! 2. Persist the user message (and the system prompt for a new conversation)
//! 3. Build the context from prior history
//! 4. Call the upstream client
//! 5. Persist the assistant reply and return it
//!
//! Turns on the same conversation are serialized through
//! [`ConversationLocks`]. A failed upstream call leaves the user message in
//! history and appends nothing else.

use crate::error::TurnError;
use crate::lock::ConversationLocks;
use crate::turn::{Turn, TurnState};
use parley_ai::{TokenUsage, UpstreamClient, UpstreamError};
use parley_conversation::{ContextBuilder, Message, MessageStore, NewMessage, StoreError};
use parley_core::{ConversationId, TurnId};
use rootcause::Report;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Characters of the reply included in logs.
const REPLY_PREVIEW_CHARS: usize = 150;

/// Per-turn rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSettings {
    /// Stored at position 0 of every new conversation.
    pub system_prompt: Option<String>,
    /// Longest accepted user message, in characters.
    pub max_message_chars: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_message_chars: 2000,
        }
    }
}

/// The result of a completed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Correlation ID used in logs.
    pub turn_id: TurnId,
    /// The conversation the turn belongs to.
    pub conversation_id: ConversationId,
    /// The assistant reply.
    pub reply: String,
    /// Position of the persisted user message.
    pub user_position: u64,
    /// Position of the persisted assistant message.
    pub assistant_position: u64,
    /// Token usage reported by the provider.
    pub usage: Option<TokenUsage>,
    /// Time spent in the upstream call.
    pub latency: Duration,
    /// Upstream attempts made.
    pub attempts: u32,
}

/// Coordinates the store, context builder and upstream client for each turn.
#[derive(Clone)]
pub struct ConversationOrchestrator {
    store: Arc<dyn MessageStore>,
    builder: ContextBuilder,
    upstream: UpstreamClient,
    locks: ConversationLocks,
    settings: TurnSettings,
}

impl std::fmt::Debug for ConversationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationOrchestrator")
            .field("builder", &self.builder)
            .field("upstream", &self.upstream)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ConversationOrchestrator {
    /// Creates an orchestrator with default turn settings.
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        builder: ContextBuilder,
        upstream: UpstreamClient,
    ) -> Self {
        Self {
            store,
            builder,
            upstream,
            locks: ConversationLocks::new(),
            settings: TurnSettings::default(),
        }
    }

    /// Replaces the turn settings.
    #[must_use]
    pub fn with_settings(mut self, settings: TurnSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the turn settings.
    #[must_use]
    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    /// Returns a conversation's history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `TurnError::Storage` if history cannot be read.
    pub async fn history(
        &self,
        conversation_id: &ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, Report<TurnError>> {
        self.store
            .history(conversation_id, limit)
            .await
            .map_err(store_failure)
    }

    /// Handles one user turn and returns the assistant reply.
    ///
    /// # Errors
    ///
    /// - `TurnError::InvalidInput` if the text is empty or too long
    /// - `TurnError::UpstreamTimeout`, `UpstreamRejected` or
    ///   `UpstreamUnavailable` if no reply was obtained
    /// - `TurnError::InvalidSequence` or `Storage` if history could not be
    ///   updated
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub async fn handle_turn(
        &self,
        conversation_id: &ConversationId,
        user_text: &str,
        client_message_id: Option<String>,
    ) -> Result<TurnOutcome, Report<TurnError>> {
        let text = self.validate(user_text)?;

        let _guard = self.locks.acquire(conversation_id).await;

        let mut history = self
            .store
            .history(conversation_id, None)
            .await
            .map_err(store_failure)?;

        if history.is_empty()
            && let Some(prompt) = &self.settings.system_prompt
        {
            let system = self
                .store
                .append(conversation_id, NewMessage::system(prompt.clone()).at_position(0))
                .await
                .map_err(store_failure)?;
            history.push(system);
        }

        let user = self
            .store
            .append(
                conversation_id,
                NewMessage::user(text)
                    .with_client_message_id(client_message_id)
                    .at_position(history.len() as u64),
            )
            .await
            .map_err(store_failure)?;
        let mut turn = Turn::received(conversation_id.clone());

        let payload = self.builder.build(&history, text);
        step(&mut turn, TurnState::ContextBuilt);
        tracing::debug!(
            turn_id = %turn.id(),
            messages = payload.messages.len(),
            estimated_cost = payload.estimated_cost,
            omitted = payload.omitted,
            "Context built"
        );

        step(&mut turn, TurnState::UpstreamCalled);
        let completion = match self.upstream.complete(&payload, conversation_id).await {
            Ok(completion) => completion,
            Err(report) => {
                step(&mut turn, TurnState::Failed);
                tracing::warn!(
                    turn_id = %turn.id(),
                    error = %report.current_context(),
                    "Turn failed; user message kept without reply"
                );
                return Err(upstream_failure(report));
            }
        };

        let assistant = self
            .store
            .append(
                conversation_id,
                NewMessage::assistant(completion.reply.clone()).at_position(user.position + 1),
            )
            .await
            .map_err(store_failure)?;
        step(&mut turn, TurnState::Persisted);

        let latency_ms = u64::try_from(completion.latency.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            turn_id = %turn.id(),
            attempts = completion.attempts,
            latency_ms,
            reply = %preview(&completion.reply, REPLY_PREVIEW_CHARS),
            "Turn completed"
        );
        step(&mut turn, TurnState::Completed);

        Ok(TurnOutcome {
            turn_id: turn.id(),
            conversation_id: conversation_id.clone(),
            reply: completion.reply,
            user_position: user.position,
            assistant_position: assistant.position,
            usage: completion.usage,
            latency: completion.latency,
            attempts: completion.attempts,
        })
    }

    fn validate<'a>(&self, user_text: &'a str) -> Result<&'a str, Report<TurnError>> {
        let text = user_text.trim();
        if text.is_empty() {
            return Err(TurnError::InvalidInput {
                reason: "message must not be empty".to_string(),
            }
            .into());
        }

        let max = self.settings.max_message_chars;
        if text.chars().count() > max {
            return Err(TurnError::InvalidInput {
                reason: format!("message is longer than {max} characters"),
            }
            .into());
        }

        Ok(text)
    }
}

fn step(turn: &mut Turn, next: TurnState) {
    if let Err(e) = turn.advance(next) {
        tracing::error!(turn_id = %turn.id(), error = %e, "Unexpected turn transition");
    }
}

fn store_failure(report: Report<StoreError>) -> Report<TurnError> {
    let context = TurnError::from(report.current_context());
    report.context(context)
}

fn upstream_failure(report: Report<UpstreamError>) -> Report<TurnError> {
    let context = TurnError::from(report.current_context());
    report.context(context)
}

/// Truncates `text` to at most `max_chars` characters for logging.
#[must_use]
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
