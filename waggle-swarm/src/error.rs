//! Error types for the swarm coordinator

use thiserror::Error;
use waggle_core::{AgentId, DirectiveId};

/// Result type alias for swarm operations.
pub type SwarmResult<T> = Result<T, SwarmError>;

/// Errors raised by the queen, workers, and the runtime.
#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("worker not found: {0}")]
    WorkerNotFound(AgentId),

    #[error("worker limit reached ({0})")]
    WorkerLimitReached(usize),

    #[error("not the leader")]
    NotLeader,

    #[error("directive not found: {0}")]
    DirectiveNotFound(DirectiveId),

    #[error("directive {0} already settled")]
    DirectiveSettled(DirectiveId),

    #[error("no healthy capable worker for directive {0}")]
    NoCapableWorker(DirectiveId),

    #[error("decision not found: {0}")]
    DecisionNotFound(waggle_core::ProposalId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Task(#[from] waggle_task::TaskError),

    #[error(transparent)]
    Consensus(#[from] waggle_consensus::ConsensusError),

    #[error(transparent)]
    Admission(#[from] waggle_admission::AdmissionError),

    #[error(transparent)]
    Provider(#[from] waggle_router::ProviderError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<waggle_config::ConfigError> for SwarmError {
    fn from(e: waggle_config::ConfigError) -> Self {
        SwarmError::InvalidConfig(e.to_string())
    }
}
