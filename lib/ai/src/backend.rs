//! Completion backend abstraction.
//!
//! The upstream client depends only on "a callable completion function".
//! Production wires in the OpenAI-compatible HTTP backend; tests inject
//! scripted implementations.

use crate::error::LlmError;
use async_trait::async_trait;
use parley_conversation::{ContextMessage, ContextPayload};
use serde::{Deserialize, Serialize};

/// A request to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Messages in the order they are sent.
    pub messages: Vec<ContextMessage>,
}

impl LlmRequest {
    /// Creates a request from an assembled context payload.
    #[must_use]
    pub fn from_payload(payload: &ContextPayload) -> Self {
        Self {
            messages: payload.messages.clone(),
        }
    }
}

/// A reply from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// The generated reply text.
    pub content: String,
    /// Token usage statistics, when the provider reports them.
    pub usage: Option<TokenUsage>,
    /// Model that generated the response.
    pub model: String,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of input tokens.
    pub input_tokens: u32,
    /// Number of output tokens.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Returns the total number of tokens.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Trait for completion backends.
///
/// One call is one attempt; retrying is the caller's job.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Generates a reply for the given request.
    ///
    /// # Errors
    ///
    /// Returns a classified error if the attempt fails.
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Returns the model name.
    fn model(&self) -> &str;
}
