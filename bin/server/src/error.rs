//! HTTP error mapping.
//!
//! Turn failures are mapped from the current context of their report; the
//! full report goes to the log, while the response carries a user-safe
//! message.

use crate::types::ErrorBody;
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use parley_core::ParseIdError;
use parley_gateway::TurnError;
use rootcause::Report;
use std::fmt;

/// Seconds a client is asked to wait after an upstream outage.
pub const RETRY_AFTER_SECS: u64 = 5;

/// Errors returned by API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The request body could not be decoded.
    InvalidBody { reason: String },
    /// The conversation ID is malformed.
    InvalidConversationId(ParseIdError),
    /// The turn failed.
    Turn(Report<TurnError>),
    /// A webhook handshake carried the wrong mode or token.
    WebhookForbidden,
}

impl From<Report<TurnError>> for ApiError {
    fn from(report: Report<TurnError>) -> Self {
        Self::Turn(report)
    }
}

impl From<ParseIdError> for ApiError {
    fn from(error: ParseIdError) -> Self {
        Self::InvalidConversationId(error)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBody { reason } => write!(f, "invalid request body: {reason}"),
            Self::InvalidConversationId(e) => write!(f, "{e}"),
            Self::Turn(report) => write!(f, "{}", report.current_context()),
            Self::WebhookForbidden => write!(f, "webhook verification failed"),
        }
    }
}

impl ApiError {
    /// Status, error code, user-facing message and retryability.
    fn parts(&self) -> (StatusCode, &'static str, String, bool) {
        match self {
            Self::InvalidBody { reason } => (
                StatusCode::BAD_REQUEST,
                "invalid_input",
                format!("Invalid request body: {reason}"),
                false,
            ),
            Self::InvalidConversationId(e) => (
                StatusCode::BAD_REQUEST,
                "invalid_input",
                format!("Invalid conversation id: {}", e.reason),
                false,
            ),
            Self::WebhookForbidden => (
                StatusCode::FORBIDDEN,
                "forbidden",
                "Webhook verification failed".to_string(),
                false,
            ),
            Self::Turn(report) => {
                let error = report.current_context();
                let (status, message) = match error {
                    TurnError::InvalidInput { reason } => {
                        (StatusCode::BAD_REQUEST, format!("Invalid message: {reason}"))
                    }
                    TurnError::UpstreamTimeout { .. } => (
                        StatusCode::GATEWAY_TIMEOUT,
                        "The assistant took too long to answer".to_string(),
                    ),
                    TurnError::UpstreamUnavailable { .. } => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "The assistant is temporarily unavailable".to_string(),
                    ),
                    TurnError::UpstreamRejected { .. } => (
                        StatusCode::BAD_GATEWAY,
                        "The assistant provider rejected the request".to_string(),
                    ),
                    TurnError::InvalidSequence { .. } | TurnError::Storage { .. } => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Conversation history could not be updated".to_string(),
                    ),
                };
                (status, error.code(), message, error.is_retryable())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, retryable) = self.parts();

        match &self {
            Self::Turn(report) if status.is_server_error() => {
                tracing::error!(status = %status, error = ?report, "Turn failed");
            }
            _ => tracing::debug!(status = %status, error = %self, "Request rejected"),
        }

        let body = ErrorBody {
            error: code.to_string(),
            message,
            retryable,
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}
