//! Error types for admission control

use std::time::Duration;
use thiserror::Error;

/// Result type alias for admission operations.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Errors surfaced by limiters, policies, and the backpressure queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    #[error("rate limited on {dimension}")]
    RateLimited {
        dimension: String,
        retry_after: Option<Duration>,
    },

    #[error("budget exceeded for {window} window")]
    BudgetExceeded { window: String },

    #[error("concurrency slots exhausted")]
    ConcurrencyExhausted,

    #[error("queue is full")]
    QueueFull,

    #[error("queued item timed out after {0:?}")]
    QueueTimeout(Duration),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AdmissionError {
    /// Whether the caller can reasonably retry after waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::RateLimited { .. }
                | AdmissionError::QueueFull
                | AdmissionError::QueueTimeout(_)
                | AdmissionError::CircuitOpen
        )
    }
}
