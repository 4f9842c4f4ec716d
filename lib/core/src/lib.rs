//! Core types and utilities for the parley conversational gateway.
//!
//! This crate provides the identifiers and the error-handling foundation
//! shared by the conversation, AI and gateway crates.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ConversationId, MessageId, ParseIdError, TurnId};
