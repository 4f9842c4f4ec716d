//! Error types for the AI crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `LlmError`: A single failed attempt against the provider backend
//! - `UpstreamError`: The outcome of a whole `complete` call, after retries

use std::fmt;

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expected to succeed on retry (network, 5xx, rate limit).
    Transient,
    /// Will fail again (malformed request, credentials, policy).
    Permanent,
}

/// Errors from a single backend attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// Connection or transport failure.
    Network { reason: String },
    /// The attempt exceeded the per-request timeout.
    Timeout,
    /// Provider returned a 5xx (or 408) response.
    ServerError { status: u16, body: String },
    /// Rate limit exceeded.
    RateLimited { retry_after_secs: Option<u64> },
    /// Provider rejected the request as malformed.
    BadRequest { status: u16, reason: String },
    /// Credential missing, invalid or not permitted.
    Unauthorized { status: u16, reason: String },
    /// Provider refused the content.
    ContentPolicy { reason: String },
    /// No API credential is configured.
    MissingCredential,
    /// Provider answered, but without a usable reply.
    InvalidResponse { reason: String },
}

impl LlmError {
    /// Classifies the failure for the retry loop.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Network { .. }
            | Self::Timeout
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::InvalidResponse { .. } => FailureClass::Transient,
            Self::BadRequest { .. }
            | Self::Unauthorized { .. }
            | Self::ContentPolicy { .. }
            | Self::MissingCredential => FailureClass::Permanent,
        }
    }

    /// Returns the provider's retry hint, if it sent one.
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { reason } => write!(f, "network error: {reason}"),
            Self::Timeout => write!(f, "request timed out"),
            Self::ServerError { status, body } => {
                write!(f, "provider returned HTTP {status}: {body}")
            }
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::BadRequest { status, reason } => {
                write!(f, "request rejected with HTTP {status}: {reason}")
            }
            Self::Unauthorized { status, reason } => {
                write!(f, "not authorized (HTTP {status}): {reason}")
            }
            Self::ContentPolicy { reason } => {
                write!(f, "content policy rejection: {reason}")
            }
            Self::MissingCredential => write!(f, "no API credential configured"),
            Self::InvalidResponse { reason } => {
                write!(f, "invalid provider response: {reason}")
            }
        }
    }
}

impl std::error::Error for LlmError {}

/// Errors from a complete upstream call.
///
/// `Timeout` and `Unavailable` mean "try again later"; `Rejected` means the
/// request itself cannot be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// The overall deadline passed before a reply arrived.
    Timeout { timeout_ms: u64 },
    /// A non-transient failure; not retried.
    Rejected { reason: String },
    /// Every attempt failed transiently.
    Unavailable { attempts: u32, last_error: String },
}

impl UpstreamError {
    /// Returns true if the caller may retry later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { timeout_ms } => {
                write!(f, "upstream did not answer within {timeout_ms}ms")
            }
            Self::Rejected { reason } => write!(f, "upstream rejected the request: {reason}"),
            Self::Unavailable {
                attempts,
                last_error,
            } => write!(
                f,
                "upstream unavailable after {attempts} attempts: {last_error}"
            ),
        }
    }
}

impl std::error::Error for UpstreamError {}
