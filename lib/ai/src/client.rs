//! Upstream client: one reply per call, with timeout and bounded retry.

use crate::backend::{CompletionBackend, LlmRequest, TokenUsage};
use crate::error::{LlmError, UpstreamError};
use crate::retry::{Attempt, RetryPolicy, Sleeper, TokioSleeper};
use parley_core::ConversationId;
use parley_conversation::ContextPayload;
use rootcause::Report;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Default overall deadline for one `complete` call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A successful upstream reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// The reply text.
    pub reply: String,
    /// Token usage reported by the provider.
    pub usage: Option<TokenUsage>,
    /// Model that produced the reply.
    pub model: String,
    /// Wall time from the first attempt to the reply.
    pub latency: Duration,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Calls a completion backend with an overall deadline and retries
/// transient failures.
#[derive(Clone)]
pub struct UpstreamClient {
    backend: Arc<dyn CompletionBackend>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    timeout: Duration,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("model", &self.backend.model())
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl UpstreamClient {
    /// Creates a client with the default retry policy and deadline.
    #[must_use]
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the overall deadline, covering all attempts and backoff.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the sleeper used between attempts.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Returns the backend's model name.
    #[must_use]
    pub fn model(&self) -> &str {
        self.backend.model()
    }

    /// Requests a reply for the assembled context.
    ///
    /// # Errors
    ///
    /// - `UpstreamError::Timeout` if no reply arrived within the deadline
    /// - `UpstreamError::Rejected` on the first non-transient failure
    /// - `UpstreamError::Unavailable` once every attempt failed transiently
    #[instrument(skip_all, fields(conversation_id = %conversation_id, messages = payload.messages.len()))]
    pub async fn complete(
        &self,
        payload: &ContextPayload,
        conversation_id: &ConversationId,
    ) -> Result<Completion, Report<UpstreamError>> {
        let request = LlmRequest::from_payload(payload);
        let started = Instant::now();

        match tokio::time::timeout(self.timeout, self.attempt_loop(&request, started)).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(timeout_ms, "Upstream call timed out");
                Err(UpstreamError::Timeout { timeout_ms }.into())
            }
        }
    }

    async fn attempt_loop(
        &self,
        request: &LlmRequest,
        started: Instant,
    ) -> Result<Completion, Report<UpstreamError>> {
        let max_attempts = self.policy.attempts();
        let mut attempt = 1;

        loop {
            let error = match Attempt::from(self.backend.generate(request).await) {
                Attempt::Success(response) => {
                    tracing::debug!(attempt, model = %response.model, "Upstream replied");
                    return Ok(Completion {
                        reply: response.content,
                        usage: response.usage,
                        model: response.model,
                        latency: started.elapsed(),
                        attempts: attempt,
                    });
                }
                Attempt::Permanent(error) => {
                    tracing::warn!(attempt, error = %error, "Upstream rejected request");
                    let reason = error.to_string();
                    return Err(Report::<LlmError>::from(error).context(UpstreamError::Rejected { reason }));
                }
                Attempt::Transient(error) => error,
            };

            if attempt >= max_attempts {
                tracing::warn!(attempts = attempt, error = %error, "Upstream retries exhausted");
                return Err(unavailable(attempt, error));
            }

            let delay = self.policy.delay_for(attempt, error.retry_after_secs());
            tracing::warn!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Transient upstream failure, retrying"
            );
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}

fn unavailable(attempts: u32, error: LlmError) -> Report<UpstreamError> {
    let last_error = error.to_string();
    Report::<LlmError>::from(error).context(UpstreamError::Unavailable {
        attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LlmResponse;
    use async_trait::async_trait;
    use parley_conversation::{ContextMessage, MessageRole};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend replaying a fixed script of results.
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<LlmResponse, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn generate(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::Network {
                    reason: "script exhausted".to_string(),
                }))
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    /// Backend that never answers.
    struct HangingBackend;

    #[async_trait]
    impl CompletionBackend for HangingBackend {
        async fn generate(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            std::future::pending().await
        }

        fn model(&self) -> &str {
            "hanging"
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    fn reply(text: &str) -> Result<LlmResponse, LlmError> {
        Ok(LlmResponse {
            content: text.to_string(),
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 4,
            }),
            model: "scripted".to_string(),
        })
    }

    fn server_error(status: u16) -> Result<LlmResponse, LlmError> {
        Err(LlmError::ServerError {
            status,
            body: "busy".to_string(),
        })
    }

    fn payload() -> ContextPayload {
        ContextPayload {
            messages: vec![ContextMessage {
                role: MessageRole::User,
                content: "How are you?".to_string(),
            }],
            estimated_cost: 12,
            omitted: 0,
        }
    }

    fn client(backend: Arc<dyn CompletionBackend>, sleeper: Arc<RecordingSleeper>) -> UpstreamClient {
        UpstreamClient::new(backend).with_sleeper(sleeper)
    }

    #[tokio::test]
    async fn first_attempt_success() {
        let backend = ScriptedBackend::new(vec![reply("Hi there")]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client(backend.clone(), sleeper.clone());

        let completion = client
            .complete(&payload(), &ConversationId::generate())
            .await
            .unwrap();

        assert_eq!(completion.reply, "Hi there");
        assert_eq!(completion.attempts, 1);
        assert_eq!(completion.usage.map(|u| u.total()), Some(14));
        assert_eq!(backend.calls(), 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_with_backoff() {
        let backend = ScriptedBackend::new(vec![server_error(503), reply("I'm good")]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client(backend.clone(), sleeper.clone());

        let completion = client
            .complete(&payload(), &ConversationId::generate())
            .await
            .unwrap();

        assert_eq!(completion.reply, "I'm good");
        assert_eq!(completion.attempts, 2);
        assert_eq!(backend.calls(), 2);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_millis(500)]
        );
    }

    #[tokio::test]
    async fn rate_limit_hint_stretches_delay() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::RateLimited {
                retry_after_secs: Some(2),
            }),
            reply("ok"),
        ]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client(backend, sleeper.clone());

        client
            .complete(&payload(), &ConversationId::generate())
            .await
            .unwrap();

        assert_eq!(*sleeper.delays.lock().unwrap(), vec![Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn exhausted_retries_are_unavailable() {
        let backend = ScriptedBackend::new(vec![
            server_error(503),
            server_error(502),
            server_error(500),
            reply("too late"),
        ]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client(backend.clone(), sleeper.clone());

        let err = client
            .complete(&payload(), &ConversationId::generate())
            .await
            .unwrap_err();

        match err.current_context() {
            UpstreamError::Unavailable {
                attempts,
                last_error,
            } => {
                assert_eq!(*attempts, 3);
                assert!(last_error.contains("500"));
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(backend.calls(), 3);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_millis(500), Duration::from_millis(1_000)]
        );
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::Unauthorized {
                status: 401,
                reason: "invalid key".to_string(),
            }),
            reply("unreachable"),
        ]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client(backend.clone(), sleeper.clone());

        let err = client
            .complete(&payload(), &ConversationId::generate())
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            UpstreamError::Rejected { .. }
        ));
        assert!(!err.current_context().is_retryable());
        assert_eq!(backend.calls(), 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_retry_policy_makes_one_attempt() {
        let backend = ScriptedBackend::new(vec![server_error(503), reply("later")]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client(backend.clone(), sleeper).with_policy(RetryPolicy::no_retry());

        let err = client
            .complete(&payload(), &ConversationId::generate())
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            UpstreamError::Unavailable { attempts: 1, .. }
        ));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_backend_times_out() {
        let client = UpstreamClient::new(Arc::new(HangingBackend))
            .with_timeout(Duration::from_secs(5));

        let err = client
            .complete(&payload(), &ConversationId::generate())
            .await
            .unwrap_err();

        assert_eq!(
            err.current_context(),
            &UpstreamError::Timeout { timeout_ms: 5_000 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_covers_backoff_sleeps() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::RateLimited {
                retry_after_secs: Some(8),
            }),
            reply("too late"),
        ]);
        let client = UpstreamClient::new(backend.clone()).with_timeout(Duration::from_secs(3));

        let err = client
            .complete(&payload(), &ConversationId::generate())
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            UpstreamError::Timeout { .. }
        ));
        assert_eq!(backend.calls(), 1);
    }
}
