//! Outbound message bus
//!
//! One bounded channel per worker gives per-target FIFO delivery; across
//! targets only the broadcast loop's order holds. Typed payloads, no
//! free-form emitter.

use crate::error::{SwarmError, SwarmResult};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use waggle_core::{AgentId, DirectiveId, Priority, ProposalId, TaskId};

/// Messages delivered to a worker's mailbox.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    /// Execute a directive.
    Directive {
        id: DirectiveId,
        task: Option<TaskId>,
        payload: serde_json::Value,
        priority: Priority,
        /// Time remaining until the directive aborts.
        time_budget: Duration,
    },
    /// A collective decision wants this worker's ballot.
    VoteRequest {
        decision: ProposalId,
        value: serde_json::Value,
        /// Time remaining until the decision aborts.
        time_budget: Duration,
    },
    /// The directive was reassigned or aborted; stop working on it.
    Cancel { id: DirectiveId },
    /// The swarm is shutting down.
    Shutdown,
}

const MAILBOX_DEPTH: usize = 64;

/// Per-worker mailboxes.
#[derive(Default)]
pub struct MessageBus {
    mailboxes: DashMap<AgentId, mpsc::Sender<WorkerMessage>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a mailbox for a worker, returning the receiving half.
    pub fn register(&self, worker: AgentId) -> mpsc::Receiver<WorkerMessage> {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.mailboxes.insert(worker, tx);
        rx
    }

    pub fn unregister(&self, worker: AgentId) {
        self.mailboxes.remove(&worker);
    }

    /// Deliver to one worker, preserving that worker's FIFO order.
    pub async fn send(&self, worker: AgentId, message: WorkerMessage) -> SwarmResult<()> {
        let tx = self
            .mailboxes
            .get(&worker)
            .map(|entry| entry.value().clone())
            .ok_or(SwarmError::WorkerNotFound(worker))?;
        tx.send(message)
            .await
            .map_err(|_| SwarmError::WorkerNotFound(worker))
    }

    /// Deliver to each target in turn; failures are reported per target.
    pub async fn broadcast(
        &self,
        targets: &BTreeSet<AgentId>,
        message: WorkerMessage,
    ) -> Vec<(AgentId, SwarmResult<()>)> {
        let mut results = Vec::with_capacity(targets.len());
        for &target in targets {
            results.push((target, self.send(target, message.clone()).await));
        }
        results
    }

    pub fn is_registered(&self, worker: AgentId) -> bool {
        self.mailboxes.contains_key(&worker)
    }

    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_per_target_fifo() {
        let bus = MessageBus::new();
        let worker = AgentId::new();
        let mut mailbox = bus.register(worker);

        for _ in 0..3 {
            bus.send(
                worker,
                WorkerMessage::Directive {
                    id: DirectiveId::new(),
                    task: None,
                    payload: serde_json::Value::Null,
                    priority: Priority::Normal,
                    time_budget: Duration::from_secs(1),
                },
            )
            .await
            .unwrap();
        }
        bus.send(worker, WorkerMessage::Shutdown).await.unwrap();

        let mut directives = 0;
        while let Some(message) = mailbox.recv().await {
            match message {
                WorkerMessage::Directive { .. } => directives += 1,
                WorkerMessage::Shutdown => break,
                WorkerMessage::VoteRequest { .. } | WorkerMessage::Cancel { .. } => {}
            }
        }
        assert_eq!(directives, 3);
    }

    #[tokio::test]
    async fn test_unknown_target_errors() {
        let bus = MessageBus::new();
        let result = bus.send(AgentId::new(), WorkerMessage::Shutdown).await;
        assert!(matches!(result, Err(SwarmError::WorkerNotFound(_))));
    }

    #[tokio::test]
    async fn test_broadcast_reports_per_target() {
        let bus = MessageBus::new();
        let known = AgentId::new();
        let unknown = AgentId::new();
        let _mailbox = bus.register(known);

        let targets = BTreeSet::from([known, unknown]);
        let results = bus.broadcast(&targets, WorkerMessage::Shutdown).await;
        assert_eq!(results.len(), 2);
        let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
        assert_eq!(ok, 1);
    }
}
