//! Turn-level errors.
//!
//! Store and upstream reports are wrapped with a `TurnError` context when
//! they leave the orchestrator, so callers match on one taxonomy while the
//! report keeps the lower-level cause.

use parley_ai::UpstreamError;
use parley_conversation::StoreError;
use std::fmt;

/// Why a turn did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    /// The user text was empty or too long.
    InvalidInput { reason: String },
    /// History would lose its gapless, system-first ordering.
    InvalidSequence { reason: String },
    /// No reply within the upstream deadline.
    UpstreamTimeout { timeout_ms: u64 },
    /// The provider refused the request for good.
    UpstreamRejected { reason: String },
    /// Every upstream attempt failed transiently.
    UpstreamUnavailable { attempts: u32, last_error: String },
    /// History could not be read or written.
    Storage { reason: String },
}

impl TurnError {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::InvalidSequence { .. } => "invalid_sequence",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::Storage { .. } => "storage",
        }
    }

    /// Returns true if sending the same turn later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout { .. } | Self::UpstreamUnavailable { .. }
        )
    }
}

impl From<&StoreError> for TurnError {
    fn from(error: &StoreError) -> Self {
        match error {
            StoreError::InvalidSequence { .. } => Self::InvalidSequence {
                reason: error.to_string(),
            },
            StoreError::Corrupted { .. } | StoreError::StorageFailed { .. } => Self::Storage {
                reason: error.to_string(),
            },
        }
    }
}

impl From<&UpstreamError> for TurnError {
    fn from(error: &UpstreamError) -> Self {
        match error {
            UpstreamError::Timeout { timeout_ms } => Self::UpstreamTimeout {
                timeout_ms: *timeout_ms,
            },
            UpstreamError::Rejected { reason } => Self::UpstreamRejected {
                reason: reason.clone(),
            },
            UpstreamError::Unavailable {
                attempts,
                last_error,
            } => Self::UpstreamUnavailable {
                attempts: *attempts,
                last_error: last_error.clone(),
            },
        }
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { reason } => write!(f, "invalid input: {reason}"),
            Self::InvalidSequence { reason } => write!(f, "invalid sequence: {reason}"),
            Self::UpstreamTimeout { timeout_ms } => {
                write!(f, "upstream timed out after {timeout_ms}ms")
            }
            Self::UpstreamRejected { reason } => write!(f, "upstream rejected: {reason}"),
            Self::UpstreamUnavailable {
                attempts,
                last_error,
            } => write!(
                f,
                "upstream unavailable after {attempts} attempts: {last_error}"
            ),
            Self::Storage { reason } => write!(f, "storage error: {reason}"),
        }
    }
}

impl std::error::Error for TurnError {}
