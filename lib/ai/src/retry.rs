//! Retry policy and backoff.
//!
//! Attempts are turned into an explicit [`Attempt`] outcome and fed to a
//! bounded loop. Delays are computed, never randomized, and slept through a
//! [`Sleeper`] so tests can observe them without waiting.

use crate::backend::LlmResponse;
use crate::error::{FailureClass, LlmError};
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of one backend attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// The provider replied.
    Success(LlmResponse),
    /// Failed, but may succeed if repeated.
    Transient(LlmError),
    /// Failed for good.
    Permanent(LlmError),
}

impl From<Result<LlmResponse, LlmError>> for Attempt {
    fn from(result: Result<LlmResponse, LlmError>) -> Self {
        match result {
            Ok(response) if response.content.trim().is_empty() => {
                Self::Transient(LlmError::InvalidResponse {
                    reason: "reply was empty".to_string(),
                })
            }
            Ok(response) => Self::Success(response),
            Err(e) => match e.class() {
                FailureClass::Transient => Self::Transient(e),
                FailureClass::Permanent => Self::Permanent(e),
            },
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2,
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Effective attempt count; always at least one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (1 for the first retry).
    ///
    /// A provider hint raises the delay but never past `max_backoff`.
    #[must_use]
    pub fn delay_for(&self, retry: u32, retry_after_secs: Option<u64>) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        let computed = self.initial_backoff.saturating_mul(factor);
        let hinted = retry_after_secs
            .map(Duration::from_secs)
            .map_or(computed, |hint| hint.max(computed));
        hinted.min(self.max_backoff)
    }
}

/// Sleeps between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Waits for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
