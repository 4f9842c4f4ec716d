//! Axum router and handlers.
//!
//! Routes, mounted under the configured API prefix:
//! - `POST /chat`: one conversation turn
//! - `POST /responder`: single-message form of `/chat`
//! - `GET /conversations/{id}/messages`: stored history
//! - `GET /webhook`, `POST /webhook`: WhatsApp handshake and inbound messages,
//!   only when the channel is configured
//!
//! Middleware: CORS and request tracing.

use crate::config::CorsConfig;
use crate::error::ApiError;
use crate::state::AppState;
use crate::types::{
    ChatRequest, ChatResponse, HistoryQuery, HistoryResponse, ResponderRequest, ResponderResponse,
    WebhookAck,
};
use crate::whatsapp::{VerifyQuery, WebhookPayload};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::{Json, Router};
use parley_core::ConversationId;
use parley_gateway::{TurnOutcome, preview};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Characters of an inbound message included in logs.
const INBOUND_PREVIEW_CHARS: usize = 50;

/// Builds the application router.
pub fn build_router(state: AppState, prefix: &str, cors: &CorsConfig) -> Router {
    let mut api = Router::new()
        .route("/chat", post(chat))
        .route("/responder", post(responder))
        .route("/conversations/{id}/messages", get(messages));
    if state.whatsapp.is_some() {
        api = api.route("/webhook", get(verify_webhook).post(receive_webhook));
    }
    let api = api.with_state(state);

    let router = if prefix.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(prefix, api)
    };

    router
        .layer(cors_layer(cors))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(cors: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    match cors.origins() {
        None => layer.allow_origin(Any),
        Some(origins) => {
            let values: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            layer.allow_origin(AllowOrigin::list(values))
        }
    }
}

/// Parses a caller-supplied ID or starts a new conversation.
fn resolve_conversation(raw: Option<String>) -> Result<ConversationId, ApiError> {
    match raw.filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => Ok(ConversationId::parse(raw)?),
        None => Ok(ConversationId::generate()),
    }
}

async fn run_turn(
    state: &AppState,
    conversation_id: Option<String>,
    message: &str,
    client_message_id: Option<String>,
) -> Result<TurnOutcome, ApiError> {
    let conversation_id = resolve_conversation(conversation_id)?;
    tracing::info!(
        conversation_id = %conversation_id,
        message = %preview(message, INBOUND_PREVIEW_CHARS),
        "Received message"
    );

    Ok(state
        .orchestrator
        .handle_turn(&conversation_id, message, client_message_id)
        .await?)
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidBody {
        reason: e.body_text(),
    })?;

    let outcome = run_turn(
        &state,
        request.conversation_id,
        &request.message,
        request.client_message_id,
    )
    .await?;

    Ok(Json(ChatResponse {
        conversation_id: outcome.conversation_id.to_string(),
        reply: outcome.reply,
    }))
}

async fn responder(
    State(state): State<AppState>,
    payload: Result<Json<ResponderRequest>, JsonRejection>,
) -> Result<Json<ResponderResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidBody {
        reason: e.body_text(),
    })?;

    let outcome = run_turn(&state, request.conversation_id, &request.message, None).await?;

    Ok(Json(ResponderResponse {
        response: outcome.reply,
        conversation_id: outcome.conversation_id.to_string(),
    }))
}

async fn messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::InvalidBody {
        reason: e.body_text(),
    })?;
    let conversation_id = ConversationId::parse(id)?;

    let messages = state
        .orchestrator
        .history(&conversation_id, query.limit)
        .await?;

    Ok(Json(HistoryResponse {
        conversation_id: conversation_id.to_string(),
        messages,
    }))
}

async fn verify_webhook(
    State(state): State<AppState>,
    query: Result<Query<VerifyQuery>, QueryRejection>,
) -> Result<String, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::InvalidBody {
        reason: e.body_text(),
    })?;
    let channel = state.whatsapp.as_ref().ok_or(ApiError::WebhookForbidden)?;

    match channel.verify(
        query.mode.as_deref(),
        query.verify_token.as_deref(),
        query.challenge,
    ) {
        Some(challenge) => {
            tracing::info!("WhatsApp webhook verified");
            Ok(challenge)
        }
        None => {
            tracing::warn!(mode = ?query.mode, "WhatsApp webhook verification failed");
            Err(ApiError::WebhookForbidden)
        }
    }
}

async fn receive_webhook(
    State(state): State<AppState>,
    payload: Result<Json<WebhookPayload>, JsonRejection>,
) -> Result<Json<WebhookAck>, ApiError> {
    let Json(payload) = payload.map_err(|e| ApiError::InvalidBody {
        reason: e.body_text(),
    })?;
    let channel = state.whatsapp.clone().ok_or(ApiError::WebhookForbidden)?;

    let Some(message) = payload.first_message() else {
        tracing::debug!("Webhook notification without messages");
        return Ok(Json(WebhookAck::ignored()));
    };
    let Some(text) = message.text.as_ref() else {
        tracing::debug!(from = %message.from, "Ignoring non-text WhatsApp message");
        return Ok(Json(WebhookAck::ignored()));
    };

    let outcome = match run_turn(
        &state,
        Some(message.from.clone()),
        &text.body,
        message.id.clone(),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(ApiError::Turn(report)) => {
            let error = report.current_context();
            tracing::warn!(from = %message.from, error = %error, "WhatsApp turn failed");
            return Ok(Json(WebhookAck::failed(error.code())));
        }
        Err(e) => return Err(e),
    };

    if let Err(report) = channel
        .sender()
        .send_text(&message.from, &outcome.reply)
        .await
    {
        tracing::error!(
            conversation_id = %outcome.conversation_id,
            error = ?report,
            "Cannot deliver WhatsApp reply"
        );
        return Ok(Json(WebhookAck::failed("delivery_failed")));
    }

    tracing::info!(conversation_id = %outcome.conversation_id, "Delivered WhatsApp reply");
    Ok(Json(WebhookAck::ok()))
}
