//! Provider error classification
//!
//! Every backend failure is folded into one of these kinds so retry policy
//! is uniform: rate-limit, server, network, and timeout errors are
//! retryable; auth, unknown-model, and invalid-request errors are not.

use thiserror::Error;
use std::time::Duration;
use waggle_admission::AdmissionError;

/// Result type alias for router operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Classified provider failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("rate limited by {provider}")]
    RateLimit {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider {provider} exceeded its token budget")]
    BudgetExceeded { provider: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

impl ProviderError {
    /// Stable kind tag for events and stream error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Auth { .. } => "auth",
            ProviderError::RateLimit { .. } => "rate_limit",
            ProviderError::ModelNotFound(_) => "model_not_found",
            ProviderError::Timeout => "timeout",
            ProviderError::Network(_) => "network",
            ProviderError::Server { .. } => "server",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::BudgetExceeded { .. } => "budget_exceeded",
            ProviderError::Cancelled => "cancelled",
            ProviderError::Admission(_) => "admission",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimit { .. }
            | ProviderError::Timeout
            | ProviderError::Network(_)
            | ProviderError::Server { .. } => true,
            ProviderError::Admission(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the fallback chain should still be walked after this error.
    /// Auth and malformed requests fail identically everywhere, so they
    /// surface immediately.
    pub fn allows_failover(&self) -> bool {
        !matches!(
            self,
            ProviderError::Auth { .. } | ProviderError::InvalidRequest(_) | ProviderError::Cancelled
        )
    }
}
