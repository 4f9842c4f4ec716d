//! Error types for the conversation crate.
//!
//! Store operations return `rootcause::Report<StoreError>`; callers in the
//! gateway wrap these with turn-level context.

use parley_core::ConversationId;
use std::fmt;

/// Errors from message store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The append would break the gapless, system-first sequence.
    ///
    /// Seeing this means two writers raced on one conversation.
    InvalidSequence {
        conversation_id: ConversationId,
        next_position: u64,
        reason: String,
    },
    /// A persisted record could not be read back.
    Corrupted {
        conversation_id: ConversationId,
        line: usize,
        reason: String,
    },
    /// Storage operation failed.
    StorageFailed { reason: String },
}

impl StoreError {
    /// Returns true for sequence violations.
    #[must_use]
    pub fn is_invalid_sequence(&self) -> bool {
        matches!(self, Self::InvalidSequence { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSequence {
                conversation_id,
                next_position,
                reason,
            } => write!(
                f,
                "invalid sequence in conversation {conversation_id} at position {next_position}: {reason}"
            ),
            Self::Corrupted {
                conversation_id,
                line,
                reason,
            } => write!(
                f,
                "stored history for conversation {conversation_id} is corrupted at line {line}: {reason}"
            ),
            Self::StorageFailed { reason } => write!(f, "message storage failed: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}
