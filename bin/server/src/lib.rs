//! parley HTTP gateway.
//!
//! Exposes the conversation orchestrator over a small JSON API and, when
//! configured, a WhatsApp Business webhook.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod types;
pub mod whatsapp;
