//! OpenAI-compatible chat completions backend.
//!
//! Works against any `/chat/completions` endpoint (OpenRouter by default).
//! Each `generate` call is a single HTTP attempt; HTTP statuses and transport
//! errors are mapped onto [`LlmError`] so the upstream client can classify
//! them.

use crate::backend::{CompletionBackend, LlmRequest, LlmResponse, TokenUsage};
use crate::error::LlmError;
use async_trait::async_trait;
use parley_conversation::ContextMessage;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "deepseek/deepseek-r1:free";

/// Longest provider error body kept in error messages.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Configuration for an OpenAI-compatible backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenAiCompatConfig {
    /// Base URL for the API, without the `/chat/completions` suffix.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// API key sent as a bearer token.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Sampling temperature; clamped to `[0, 2]` when sent.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum tokens to generate.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Timeout for a single HTTP attempt, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl OpenAiCompatConfig {
    /// Returns the configured API key, ignoring blank values.
    #[must_use]
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ContextMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Backend speaking the OpenAI chat completions protocol.
#[derive(Debug, Clone)]
pub struct OpenAiCompatBackend {
    http: reqwest::Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatBackend {
    /// Creates a backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| LlmError::Network {
                reason: format!("cannot build HTTP client: {e}"),
            })?;

        if config.credential().is_none() {
            tracing::warn!(
                base_url = %config.base_url,
                "No API key configured for the upstream provider; completions will be rejected"
            );
        }

        Ok(Self { http, config })
    }

    /// Returns the backend configuration.
    #[must_use]
    pub fn config(&self) -> &OpenAiCompatConfig {
        &self.config
    }

    fn request_body<'a>(&'a self, request: &'a LlmRequest) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.config.model,
            messages: &request.messages,
            temperature: self.config.temperature.clamp(0.0, 2.0),
            max_tokens: self.config.max_tokens,
        }
    }
}

/// Maps a non-success HTTP status onto an attempt error.
fn classify_status(status: StatusCode, retry_after_secs: Option<u64>, body: &str) -> LlmError {
    let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    let lowered = body.to_ascii_lowercase();
    let policy_hit = ["content_filter", "content_policy", "moderation"]
        .iter()
        .any(|marker| lowered.contains(marker));

    match status.as_u16() {
        429 => LlmError::RateLimited { retry_after_secs },
        400 | 403 if policy_hit => LlmError::ContentPolicy { reason: body },
        401 | 403 => LlmError::Unauthorized {
            status: status.as_u16(),
            reason: body,
        },
        408 => LlmError::ServerError { status: 408, body },
        code if status.is_server_error() => LlmError::ServerError { status: code, body },
        code => LlmError::BadRequest {
            status: code,
            reason: body,
        },
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Extracts the reply from a decoded completion response.
fn into_response(parsed: ChatCompletionResponse, fallback_model: &str) -> Result<LlmResponse, LlmError> {
    let Some(choice) = parsed.choices.into_iter().next() else {
        return Err(LlmError::InvalidResponse {
            reason: "response contained no choices".to_string(),
        });
    };

    let content = choice.message.content.unwrap_or_default();
    if content.trim().is_empty() {
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(LlmError::ContentPolicy {
                reason: "reply withheld by content filter".to_string(),
            });
        }
        return Err(LlmError::InvalidResponse {
            reason: "reply was empty".to_string(),
        });
    }

    Ok(LlmResponse {
        content,
        usage: parsed.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
        model: parsed.model.unwrap_or_else(|| fallback_model.to_string()),
    })
}

#[async_trait]
impl CompletionBackend for OpenAiCompatBackend {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let Some(api_key) = self.config.credential() else {
            return Err(LlmError::MissingCredential);
        };

        let url = self.config.completions_url();
        tracing::debug!(
            endpoint = %url,
            model = %self.config.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Network {
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = %status, body = %body, "Provider returned error status");
            return Err(classify_status(status, retry_after, &body));
        }

        let parsed: ChatCompletionResponse =
            response.json().await.map_err(|e| LlmError::InvalidResponse {
                reason: e.to_string(),
            })?;

        into_response(parsed, &self.config.model)
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_conversation::MessageRole;

    fn backend(config: OpenAiCompatConfig) -> OpenAiCompatBackend {
        OpenAiCompatBackend::new(config).expect("client builds")
    }

    #[test]
    fn config_defaults_follow_openrouter() {
        let config = OpenAiCompatConfig::default();
        assert_eq!(config.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(config.model, "deepseek/deepseek-r1:free");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(
            config.completions_url(),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let config = OpenAiCompatConfig {
            api_key: Some("   ".to_string()),
            ..OpenAiCompatConfig::default()
        };
        assert!(config.credential().is_none());
    }

    #[test]
    fn request_body_clamps_temperature() {
        let backend = backend(OpenAiCompatConfig {
            temperature: 3.5,
            max_tokens: Some(256),
            ..OpenAiCompatConfig::default()
        });
        let request = LlmRequest {
            messages: vec![ContextMessage {
                role: MessageRole::User,
                content: "Hola".to_string(),
            }],
        };

        let body = serde_json::to_value(backend.request_body(&request)).expect("serialize");
        assert_eq!(body["temperature"], 2.0);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hola");
    }

    #[test]
    fn request_body_omits_unset_max_tokens() {
        let backend = backend(OpenAiCompatConfig::default());
        let request = LlmRequest { messages: vec![] };
        let body = serde_json::to_value(backend.request_body(&request)).expect("serialize");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(4), ""),
            LlmError::RateLimited {
                retry_after_secs: Some(4)
            }
        );
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, None, "busy"),
            LlmError::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, None, ""),
            LlmError::ServerError { status: 408, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "bad key"),
            LlmError::Unauthorized { status: 401, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "{\"error\":\"invalid model\"}"),
            LlmError::BadRequest { status: 400, .. }
        ));
        assert!(matches!(
            classify_status(
                StatusCode::FORBIDDEN,
                None,
                "{\"error\":{\"message\":\"flagged by moderation\"}}"
            ),
            LlmError::ContentPolicy { .. }
        ));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(5_000);
        let LlmError::ServerError { body, .. } =
            classify_status(StatusCode::BAD_GATEWAY, None, &body)
        else {
            panic!("expected server error");
        };
        assert_eq!(body.len(), MAX_ERROR_BODY_CHARS);
    }

    #[test]
    fn retry_after_header_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, "12".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(12));
        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn response_parsing() {
        let parsed: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "model": "deepseek/deepseek-r1",
            "choices": [{"message": {"role": "assistant", "content": "Hi there"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        }))
        .unwrap();

        let response = into_response(parsed, "fallback").unwrap();
        assert_eq!(response.content, "Hi there");
        assert_eq!(response.model, "deepseek/deepseek-r1");
        assert_eq!(response.usage.map(|u| u.total()), Some(12));
    }

    #[test]
    fn empty_or_filtered_replies_are_errors() {
        let empty: ChatCompletionResponse =
            serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        assert!(matches!(
            into_response(empty, "m"),
            Err(LlmError::InvalidResponse { .. })
        ));

        let filtered: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": null}, "finish_reason": "content_filter"}]
        }))
        .unwrap();
        assert!(matches!(
            into_response(filtered, "m"),
            Err(LlmError::ContentPolicy { .. })
        ));
    }

    #[tokio::test]
    async fn missing_credential_fails_without_network() {
        let backend = backend(OpenAiCompatConfig::default());
        let result = backend.generate(&LlmRequest { messages: vec![] }).await;
        assert_eq!(result, Err(LlmError::MissingCredential));
    }
}
