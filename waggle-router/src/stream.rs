//! Polled response stream
//!
//! Explicit `next()`/`close()` semantics over a channel fed by the
//! producing task. Closing (or dropping) the stream aborts the producer,
//! which closes the upstream connection and releases any held slots.

use crate::types::StreamEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A lazy, finite sequence of [`StreamEvent`]s ending with `Done` or
/// `Error`.
pub struct ResponseStream {
    rx: mpsc::Receiver<StreamEvent>,
    producer: Option<JoinHandle<()>>,
    finished: bool,
}

impl ResponseStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>, producer: JoinHandle<()>) -> Self {
        Self {
            rx,
            producer: Some(producer),
            finished: false,
        }
    }

    /// Next event, or `None` after the terminal event has been delivered.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        if matches!(
            event,
            Some(StreamEvent::Done { .. }) | Some(StreamEvent::Error { .. }) | None
        ) {
            self.finished = true;
        }
        event
    }

    /// Cancel the stream: abort the producer and drop whatever is buffered.
    pub fn close(&mut self) {
        self.finished = true;
        self.rx.close();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }

    /// Collect content deltas until the terminal event, returning the full
    /// text and the terminal event.
    pub async fn collect(mut self) -> (String, Option<StreamEvent>) {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Content { delta } => text.push_str(&delta),
                terminal => return (text, Some(terminal)),
            }
        }
        (text, None)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}
