//! Scheduler lifecycle events
//!
//! A typed broadcast channel per event family replaces ad-hoc listener
//! registration; subscribers that lag drop oldest events.

use tokio::sync::broadcast;
use waggle_core::{AgentId, TaskId};

/// Observable task and agent lifecycle events.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskSubmitted { task: TaskId },
    TaskAssigned { task: TaskId, agent: AgentId },
    TaskStarted { task: TaskId, agent: AgentId },
    TaskCompleted { task: TaskId },
    TaskFailed {
        task: TaskId,
        error: String,
        will_retry: bool,
    },
    TaskCancelled { task: TaskId },
    AgentRegistered { agent: AgentId },
    AgentUnregistered { agent: AgentId },
    AgentTimeout { agent: AgentId },
}

/// Shared scheduler event channel.
#[derive(Debug, Clone)]
pub struct SchedulerEvents {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}

impl Default for SchedulerEvents {
    fn default() -> Self {
        Self::new(256)
    }
}
