//! Application state shared by handlers.

use crate::config::{ServerConfig, StoreKind};
use crate::whatsapp::{GraphApiSender, WhatsAppChannel};
use parley_ai::{OpenAiCompatBackend, UpstreamClient};
use parley_conversation::{ContextBuilder, InMemoryMessageStore, JsonlMessageStore, MessageStore};
use parley_gateway::ConversationOrchestrator;
use rootcause::Report;
use std::fmt;
use std::sync::Arc;

/// Errors while assembling the application at startup.
#[derive(Debug)]
pub enum StartupError {
    /// The history store could not be opened.
    Store { reason: String },
    /// The provider backend could not be created.
    Provider { reason: String },
    /// The WhatsApp channel is enabled but incomplete.
    WhatsApp { reason: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store { reason } => write!(f, "cannot open message store: {reason}"),
            Self::Provider { reason } => write!(f, "cannot create provider backend: {reason}"),
            Self::WhatsApp { reason } => write!(f, "cannot enable WhatsApp channel: {reason}"),
        }
    }
}

impl std::error::Error for StartupError {}

/// Shared state for all routes.
#[derive(Debug, Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConversationOrchestrator>,
    /// Set when the WhatsApp webhook is served.
    pub whatsapp: Option<Arc<WhatsAppChannel>>,
}

impl AppState {
    #[must_use]
    pub fn new(orchestrator: ConversationOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            whatsapp: None,
        }
    }

    /// Serves the WhatsApp webhook through `channel`.
    #[must_use]
    pub fn with_whatsapp(mut self, channel: WhatsAppChannel) -> Self {
        self.whatsapp = Some(Arc::new(channel));
        self
    }

    /// Wires store, provider and orchestrator from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file store directory cannot be created, an
    /// HTTP client cannot be built, or the WhatsApp channel has a verify token
    /// but no credentials.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, Report<StartupError>> {
        let store: Arc<dyn MessageStore> = match config.store.kind {
            StoreKind::Memory => {
                tracing::info!("Keeping conversation history in memory");
                Arc::new(InMemoryMessageStore::new())
            }
            StoreKind::File => {
                let store = JsonlMessageStore::open(config.store.directory.clone())
                    .await
                    .map_err(|report| {
                        let reason = report.current_context().to_string();
                        report.context(StartupError::Store { reason })
                    })?;
                Arc::new(store)
            }
        };

        let backend = OpenAiCompatBackend::new(config.provider.clone()).map_err(|e| {
            StartupError::Provider {
                reason: e.to_string(),
            }
        })?;
        tracing::info!(
            base_url = %config.provider.base_url,
            model = %config.provider.model,
            "Configured upstream provider"
        );

        let upstream = UpstreamClient::new(Arc::new(backend))
            .with_policy(config.retry.policy())
            .with_timeout(config.retry.timeout());

        let orchestrator = ConversationOrchestrator::new(
            store,
            ContextBuilder::new(config.context.clone()),
            upstream,
        )
        .with_settings(config.conversation.settings());
        let state = Self::new(orchestrator);

        let Some(verify_token) = config.whatsapp.verify_token() else {
            tracing::debug!("WhatsApp channel disabled");
            return Ok(state);
        };
        let sender = GraphApiSender::new(&config.whatsapp).map_err(|e| {
            StartupError::WhatsApp {
                reason: e.to_string(),
            }
        })?;
        tracing::info!(
            messages_url = %sender.messages_url(),
            "Serving WhatsApp webhook"
        );

        Ok(state.with_whatsapp(WhatsAppChannel::new(verify_token, Arc::new(sender))))
    }
}
