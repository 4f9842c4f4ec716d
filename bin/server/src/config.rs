//! Centralized server configuration.
//!
//! Loaded via the `config` crate from environment variables. Nested keys use
//! `__` as separator, e.g. `PROVIDER__MODEL` or `RETRY__MAX_ATTEMPTS`.
//!
//! See [`OpenAiCompatConfig`] for provider settings and [`ContextBudget`] for
//! context limits. The conventional variable names `OPENROUTER_API_KEY`,
//! `WHATSAPP_TOKEN`, `WHATSAPP_PHONE_NUMBER_ID` and `META_VERIFY_TOKEN` are
//! read as fallbacks for their nested keys.

use parley_ai::{OpenAiCompatConfig, RetryPolicy};
use parley_conversation::ContextBudget;
use parley_gateway::TurnSettings;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix for every API route.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Cross-origin settings.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Upstream provider.
    #[serde(default)]
    pub provider: OpenAiCompatConfig,

    /// Upstream retry and deadline.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Context assembly limits.
    #[serde(default)]
    pub context: ContextBudget,

    /// Per-turn rules.
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// History storage.
    #[serde(default)]
    pub store: StoreConfig,

    /// WhatsApp Business channel; off unless a verify token is set.
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,

    /// Provider key under its conventional variable name, used when
    /// `PROVIDER__API_KEY` is unset.
    #[serde(default)]
    openrouter_api_key: Option<String>,

    // Conventional WhatsApp variable names, used when the nested keys are unset.
    #[serde(default)]
    whatsapp_token: Option<String>,
    #[serde(default)]
    whatsapp_phone_number_id: Option<String>,
    #[serde(default)]
    meta_verify_token: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

/// Cross-origin configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Comma-separated origins, or `*` for any.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: String,
}

fn default_allowed_origins() -> String {
    "*".to_string()
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl CorsConfig {
    /// Returns the configured origins, or `None` when any origin is allowed.
    #[must_use]
    pub fn origins(&self) -> Option<Vec<String>> {
        let origins: Vec<String> = self
            .allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();

        if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
            None
        } else {
            Some(origins)
        }
    }
}

/// Upstream retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per turn, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff growth factor.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Upper bound on a single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Deadline for the whole upstream call, retries included, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl RetryConfig {
    /// The retry policy described by this configuration.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    /// The overall upstream deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Per-turn configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// Stored as the first message of every new conversation.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Longest accepted user message, in characters.
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

fn default_max_message_chars() -> usize {
    2000
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_message_chars: default_max_message_chars(),
        }
    }
}

impl ConversationConfig {
    /// Turn settings for the orchestrator; a blank prompt counts as none.
    #[must_use]
    pub fn settings(&self) -> TurnSettings {
        TurnSettings {
            system_prompt: self
                .system_prompt
                .as_deref()
                .map(str::trim)
                .filter(|prompt| !prompt.is_empty())
                .map(str::to_string),
            max_message_chars: self.max_message_chars,
        }
    }
}

/// Where history is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process memory; lost on restart.
    #[default]
    Memory,
    /// One JSONL file per conversation.
    File,
}

/// History storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Storage backend.
    #[serde(default)]
    pub kind: StoreKind,

    /// Directory for the file store.
    #[serde(default = "default_store_directory")]
    pub directory: PathBuf,
}

fn default_store_directory() -> PathBuf {
    PathBuf::from("data/conversations")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            directory: default_store_directory(),
        }
    }
}

/// WhatsApp Business channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppConfig {
    /// Token Meta echoes during the webhook handshake.
    #[serde(default)]
    pub verify_token: Option<String>,

    /// Graph API bearer token.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Business phone number replies are sent from.
    #[serde(default)]
    pub phone_number_id: Option<String>,

    #[serde(default = "default_whatsapp_api_version")]
    pub api_version: String,

    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
}

fn default_whatsapp_api_version() -> String {
    "v23.0".to_string()
}

fn default_graph_base_url() -> String {
    "https://graph.facebook.com".to_string()
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            verify_token: None,
            access_token: None,
            phone_number_id: None,
            api_version: default_whatsapp_api_version(),
            graph_base_url: default_graph_base_url(),
        }
    }
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

impl WhatsAppConfig {
    /// The handshake token; the channel is enabled when this is set.
    #[must_use]
    pub fn verify_token(&self) -> Option<&str> {
        non_blank(self.verify_token.as_ref())
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        non_blank(self.access_token.as_ref())
    }

    /// `{graph_base_url}/{api_version}/{phone_number_id}/messages`.
    #[must_use]
    pub fn messages_url(&self) -> Option<String> {
        let phone_number_id = non_blank(self.phone_number_id.as_ref())?;
        Some(format!(
            "{}/{}/{}/messages",
            self.graph_base_url.trim_end_matches('/'),
            self.api_version.trim_matches('/'),
            phone_number_id
        ))
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its setting.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(config::Environment::default())
    }

    fn from_environment(environment: config::Environment) -> Result<Self, config::ConfigError> {
        let mut config: Self = config::Config::builder()
            .add_source(environment.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        if config.provider.api_key.is_none() {
            config.provider.api_key = config.openrouter_api_key.take();
        }
        if config.whatsapp.access_token.is_none() {
            config.whatsapp.access_token = config.whatsapp_token.take();
        }
        if config.whatsapp.phone_number_id.is_none() {
            config.whatsapp.phone_number_id = config.whatsapp_phone_number_id.take();
        }
        if config.whatsapp.verify_token.is_none() {
            config.whatsapp.verify_token = config.meta_verify_token.take();
        }

        Ok(config)
    }

    /// The `host:port` socket address string.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The API prefix normalized to start with `/` and not end with one.
    #[must_use]
    pub fn route_prefix(&self) -> String {
        let trimmed = self.api_prefix.trim().trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }
}
