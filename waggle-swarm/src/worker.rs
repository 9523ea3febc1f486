//! Worker handle
//!
//! What an embedding application holds after registering a worker: the
//! identity and the mailbox the queen delivers into. The worker drives its
//! own loop, reporting heartbeats and results through the runtime.

use crate::bus::WorkerMessage;
use tokio::sync::mpsc;
use waggle_core::AgentId;

/// One registered worker's mailbox end.
pub struct WorkerHandle {
    id: AgentId,
    mailbox: mpsc::Receiver<WorkerMessage>,
}

impl WorkerHandle {
    pub(crate) fn new(id: AgentId, mailbox: mpsc::Receiver<WorkerMessage>) -> Self {
        Self { id, mailbox }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Next message from the queen; `None` once the mailbox closes.
    pub async fn next_message(&mut self) -> Option<WorkerMessage> {
        self.mailbox.recv().await
    }

    /// Non-blocking poll of the mailbox.
    pub fn try_next_message(&mut self) -> Option<WorkerMessage> {
        self.mailbox.try_recv().ok()
    }
}
