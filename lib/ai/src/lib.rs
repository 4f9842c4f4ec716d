//! Upstream language-model access for parley.
//!
//! This crate provides:
//!
//! - **Backend**: The injected completion function (`CompletionBackend`) and
//!   an OpenAI-compatible HTTP implementation
//! - **Retry**: Failure classification, backoff policy and the sleeper seam
//! - **Upstream Client**: Time-boxed, retrying delivery of a context payload

pub mod backend;
pub mod client;
pub mod error;
pub mod openai;
pub mod retry;

pub use backend::{CompletionBackend, LlmRequest, LlmResponse, TokenUsage};
pub use client::{Completion, UpstreamClient};
pub use error::{FailureClass, LlmError, UpstreamError};
pub use openai::{OpenAiCompatBackend, OpenAiCompatConfig};
pub use retry::{Attempt, RetryPolicy, Sleeper, TokioSleeper};
