//! Error types for the task core

use thiserror::Error;
use waggle_core::TaskId;

/// Result type alias for task operations.
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors raised by the task model, graph, queue, repository, and scheduler.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("agent not found: {0}")]
    AgentNotFound(waggle_core::AgentId),

    #[error("agent already registered: {0}")]
    AgentAlreadyRegistered(waggle_core::AgentId),

    #[error("task {0} is blocked by unfinished dependencies")]
    Blocked(TaskId),

    #[error("dependency cycle detected")]
    CycleDetected,

    #[error("task queue is full")]
    QueueFull,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::Serialization(e.to_string())
    }
}
