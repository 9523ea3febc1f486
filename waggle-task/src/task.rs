//! Task entity and state machine

use crate::error::{TaskError, TaskResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use waggle_core::{AgentId, Priority, TaskId};

/// Task execution state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted but not yet queued.
    Pending,
    /// Waiting in the ready queue.
    Queued,
    /// Bound to an agent, not yet running.
    Assigned,
    /// Executing on its agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Retries exhausted.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl TaskStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Parameters of a task submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub title: String,
    pub description: String,
    /// Drives the capability filter: an agent must carry the lowercased
    /// type as a capability tag to be eligible.
    pub task_type: String,
    pub priority: Priority,
    pub blocked_by: BTreeSet<TaskId>,
    pub blocks: BTreeSet<TaskId>,
    pub timeout_ms: Option<u64>,
    /// `None` falls back to the configured default.
    pub max_retries: Option<u32>,
    pub input: serde_json::Value,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TaskRequest {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn blocked_by(mut self, blocker: TaskId) -> Self {
        self.blocked_by.insert(blocker);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A unit of work owned by the repository and mutated only through the
/// scheduler and the agent executing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assigned_agent: Option<AgentId>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub blocked_by: BTreeSet<TaskId>,
    pub blocks: BTreeSet<TaskId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: Option<u64>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Task {
    /// Build a task from a submission, applying configured defaults.
    /// Fails on an empty title or type.
    pub fn from_request(request: TaskRequest, default_max_retries: u32) -> TaskResult<Self> {
        if request.title.trim().is_empty() {
            return Err(TaskError::InvalidArgument("task title is empty".into()));
        }
        if request.task_type.trim().is_empty() {
            return Err(TaskError::InvalidArgument("task type is empty".into()));
        }
        Ok(Self {
            id: TaskId::new(),
            title: request.title,
            description: request.description,
            task_type: request.task_type,
            status: TaskStatus::Pending,
            priority: request.priority,
            assigned_agent: None,
            input: request.input,
            output: None,
            error: None,
            blocked_by: request.blocked_by,
            blocks: request.blocks,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            timeout_ms: request.timeout_ms,
            metadata: request.metadata,
        })
    }

    /// Capability tags an agent must intersect with to take this task.
    pub fn required_capabilities(&self) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        tags.insert(self.task_type.to_lowercase());
        tags
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// PENDING -> QUEUED.
    pub fn enqueue(&mut self) -> TaskResult<()> {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Queued;
                Ok(())
            }
            _ => Err(self.transition_error("queued")),
        }
    }

    /// QUEUED -> ASSIGNED, recording the agent.
    pub fn assign(&mut self, agent: AgentId) -> TaskResult<()> {
        match self.status {
            TaskStatus::Queued => {
                self.status = TaskStatus::Assigned;
                self.assigned_agent = Some(agent);
                Ok(())
            }
            _ => Err(self.transition_error("assigned")),
        }
    }

    /// ASSIGNED -> RUNNING, stamping `started_at`.
    pub fn start(&mut self) -> TaskResult<()> {
        match self.status {
            TaskStatus::Assigned => {
                self.status = TaskStatus::Running;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(self.transition_error("running")),
        }
    }

    /// RUNNING -> COMPLETED with the output.
    pub fn complete(&mut self, output: serde_json::Value) -> TaskResult<()> {
        match self.status {
            TaskStatus::Running => {
                self.status = TaskStatus::Completed;
                self.output = Some(output);
                self.completed_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(self.transition_error("completed")),
        }
    }

    /// RUNNING -> QUEUED while retries remain (clearing the agent),
    /// otherwise RUNNING -> FAILED. Returns whether the task will retry.
    pub fn fail(&mut self, error: impl Into<String>) -> TaskResult<bool> {
        match self.status {
            TaskStatus::Running => {
                self.error = Some(error.into());
                if self.retry_count < self.max_retries {
                    self.retry_count += 1;
                    self.assigned_agent = None;
                    self.status = TaskStatus::Queued;
                    Ok(true)
                } else {
                    self.status = TaskStatus::Failed;
                    self.completed_at = Some(Utc::now());
                    Ok(false)
                }
            }
            _ => Err(self.transition_error("failed")),
        }
    }

    /// Any non-terminal state -> CANCELLED.
    pub fn cancel(&mut self, reason: Option<String>) -> TaskResult<()> {
        if self.is_terminal() {
            return Err(self.transition_error("cancelled"));
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        if let Some(reason) = reason {
            self.error = Some(reason);
        }
        Ok(())
    }

    fn transition_error(&self, to: &str) -> TaskError {
        TaskError::InvalidTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::from_request(TaskRequest::new("t", "d", "code"), 3).unwrap()
    }

    #[test]
    fn test_happy_path() {
        let mut t = task();
        assert_eq!(t.status, TaskStatus::Pending);

        t.enqueue().unwrap();
        let agent = AgentId::new();
        t.assign(agent).unwrap();
        assert_eq!(t.assigned_agent, Some(agent));

        t.start().unwrap();
        assert!(t.started_at.is_some());

        t.complete(serde_json::json!({"out": "ok"})).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn test_fail_requeues_until_exhausted() {
        let mut t = task();
        t.max_retries = 2;
        t.enqueue().unwrap();

        for attempt in 1..=2 {
            t.assign(AgentId::new()).unwrap();
            t.start().unwrap();
            assert!(t.fail("boom").unwrap());
            assert_eq!(t.status, TaskStatus::Queued);
            assert_eq!(t.retry_count, attempt);
            assert!(t.assigned_agent.is_none());
        }

        t.assign(AgentId::new()).unwrap();
        t.start().unwrap();
        assert!(!t.fail("boom").unwrap());
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.retry_count, 2);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn test_complete_from_non_running_rejected() {
        let mut t = task();
        assert!(matches!(
            t.complete(serde_json::Value::Null),
            Err(TaskError::InvalidTransition { .. })
        ));
        t.enqueue().unwrap();
        assert!(t.complete(serde_json::Value::Null).is_err());
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut t = task();
        t.cancel(Some("no longer needed".into())).unwrap();
        assert_eq!(t.status, TaskStatus::Cancelled);

        assert!(t.enqueue().is_err());
        assert!(t.assign(AgentId::new()).is_err());
        assert!(t.start().is_err());
        assert!(t.complete(serde_json::Value::Null).is_err());
        assert!(t.fail("x").is_err());
        assert!(t.cancel(None).is_err());
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        for advance in 0..4 {
            let mut t = task();
            if advance >= 1 {
                t.enqueue().unwrap();
            }
            if advance >= 2 {
                t.assign(AgentId::new()).unwrap();
            }
            if advance >= 3 {
                t.start().unwrap();
            }
            assert!(t.cancel(None).is_ok(), "cancel failed at step {}", advance);
        }
    }

    #[test]
    fn test_skipping_states_rejected() {
        let mut t = task();
        // PENDING -> ASSIGNED is not legal.
        assert!(t.assign(AgentId::new()).is_err());
        t.enqueue().unwrap();
        // QUEUED -> RUNNING is not legal.
        assert!(t.start().is_err());
    }

    #[test]
    fn test_empty_title_rejected() {
        let request = TaskRequest::new("  ", "d", "code");
        assert!(matches!(
            Task::from_request(request, 3),
            Err(TaskError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut t = task();
        t.blocked_by.insert(TaskId::new());
        t.blocks.insert(TaskId::new());
        t.metadata
            .insert("k".into(), serde_json::json!({"nested": [1, 2]}));

        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}
