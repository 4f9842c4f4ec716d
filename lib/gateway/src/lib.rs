//! Turn handling for the parley conversational gateway.
//!
//! This crate provides:
//!
//! - **Orchestrator**: Runs one conversation turn end to end
//! - **Turn state**: The validated lifecycle of a single turn
//! - **Locks**: Per-conversation mutual exclusion for concurrent turns

pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod turn;

pub use error::TurnError;
pub use lock::{ConversationGuard, ConversationLocks};
pub use orchestrator::{ConversationOrchestrator, TurnOutcome, TurnSettings, preview};
pub use turn::{TransitionError, Turn, TurnState};
