//! Conversation history and context assembly for parley.
//!
//! This crate provides:
//!
//! - **Messages**: The append-only records that make up a conversation
//! - **Message Store**: Ordered per-conversation history (in-memory or JSONL files)
//! - **Context Builder**: Budgeted selection of history to send upstream

pub mod context;
pub mod error;
pub mod file_store;
pub mod message;
pub mod store;

pub use context::{BudgetUnit, ContextBudget, ContextBuilder, ContextMessage, ContextPayload};
pub use error::StoreError;
pub use file_store::JsonlMessageStore;
pub use message::{Message, MessageRole, NewMessage};
pub use store::{InMemoryMessageStore, MessageStore};
