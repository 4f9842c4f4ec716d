//! The lifecycle of a single conversation turn.

use parley_core::{ConversationId, TurnId};
use std::fmt;

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    /// The user message is persisted.
    Received,
    /// Context for the upstream call is assembled.
    ContextBuilt,
    /// The upstream call is in flight.
    UpstreamCalled,
    /// The assistant reply is persisted.
    Persisted,
    /// The reply was handed back to the caller.
    Completed,
    /// The upstream call failed; no reply was persisted.
    Failed,
}

impl TurnState {
    /// Returns true if no further transitions are allowed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if `next` may follow this state.
    #[must_use]
    pub fn can_transition_to(&self, next: TurnState) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::ContextBuilt)
                | (Self::ContextBuilt, Self::UpstreamCalled)
                | (Self::UpstreamCalled, Self::Persisted)
                | (Self::UpstreamCalled, Self::Failed)
                | (Self::Persisted, Self::Completed)
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::ContextBuilt => "context_built",
            Self::UpstreamCalled => "upstream_called",
            Self::Persisted => "persisted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition that the turn lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: TurnState,
    pub to: TurnState,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn cannot move from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// Tracks one turn through its states.
///
/// The upstream call is the only step that can fail a turn.
#[derive(Debug, Clone)]
pub struct Turn {
    id: TurnId,
    conversation_id: ConversationId,
    state: TurnState,
}

impl Turn {
    /// Starts tracking a turn whose user message was just persisted.
    #[must_use]
    pub fn received(conversation_id: ConversationId) -> Self {
        let turn = Self {
            id: TurnId::new(),
            conversation_id,
            state: TurnState::Received,
        };
        tracing::debug!(
            turn_id = %turn.id,
            conversation_id = %turn.conversation_id,
            state = %turn.state,
            "Turn started"
        );
        turn
    }

    /// The turn's ID.
    #[must_use]
    pub fn id(&self) -> TurnId {
        self.id
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the state unchanged, if the lifecycle does
    /// not allow the transition.
    pub fn advance(&mut self, next: TurnState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(
            turn_id = %self.id,
            conversation_id = %self.conversation_id,
            from = %self.state,
            to = %next,
            "Turn transition"
        );
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut turn = Turn::received(ConversationId::generate());
        for next in [
            TurnState::ContextBuilt,
            TurnState::UpstreamCalled,
            TurnState::Persisted,
            TurnState::Completed,
        ] {
            turn.advance(next).unwrap();
        }
        assert!(turn.state().is_terminal());
    }

    #[test]
    fn upstream_failure_exit() {
        let mut turn = Turn::received(ConversationId::generate());
        turn.advance(TurnState::ContextBuilt).unwrap();
        turn.advance(TurnState::UpstreamCalled).unwrap();
        turn.advance(TurnState::Failed).unwrap();
        assert_eq!(turn.state(), TurnState::Failed);
        assert!(turn.advance(TurnState::Persisted).is_err());
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut turn = Turn::received(ConversationId::generate());
        let err = turn.advance(TurnState::Persisted).unwrap_err();
        assert_eq!(
            err,
            TransitionError {
                from: TurnState::Received,
                to: TurnState::Persisted
            }
        );
        assert_eq!(turn.state(), TurnState::Received);
        assert_eq!(
            err.to_string(),
            "turn cannot move from received to persisted"
        );
    }

    #[test]
    fn failure_only_from_upstream_step() {
        assert!(!TurnState::Received.can_transition_to(TurnState::Failed));
        assert!(!TurnState::ContextBuilt.can_transition_to(TurnState::Failed));
        assert!(!TurnState::Persisted.can_transition_to(TurnState::Failed));
        assert!(TurnState::UpstreamCalled.can_transition_to(TurnState::Failed));
    }
}
