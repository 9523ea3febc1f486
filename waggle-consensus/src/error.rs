//! Error types for the consensus engine

use thiserror::Error;

/// Result type alias for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Errors raised by elections, Byzantine voting, and the decision log.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("no quorum: required {required}, got {actual}")]
    NoQuorum { required: usize, actual: usize },

    #[error("consensus timed out after {0}ms")]
    Timeout(u64),

    #[error("invalid view: expected {expected}, got {actual}")]
    InvalidView { expected: u64, actual: u64 },

    #[error("not the leader")]
    NotLeader,

    #[error("byzantine behavior detected: {0}")]
    ByzantineDetected(String),

    #[error("invalid participant set: {0}")]
    InvalidParticipants(String),

    #[error("log write rejected: {0}")]
    LogRejected(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ConsensusError {
    /// Whether a fresh round could succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConsensusError::Timeout(_) | ConsensusError::NoQuorum { .. }
        )
    }
}
