//! Typed admission events
//!
//! One broadcast channel carrying a closed set of payloads; subscribers get
//! their own receiver and lagging subscribers drop oldest events.

use crate::breaker::CircuitState;
use crate::policy::{DenyReason, ThrottleMode};
use tokio::sync::broadcast;

/// Observable admission-control events.
#[derive(Debug, Clone)]
pub enum AdmissionEvent {
    /// A request was denied, with the first failing dimension.
    Denied {
        provider: Option<String>,
        agent: Option<String>,
        reason: DenyReason,
    },
    /// The global throttle mode changed.
    ThrottleModeChanged {
        from: ThrottleMode,
        to: ThrottleMode,
    },
    /// The backpressure queue's circuit breaker changed state.
    BreakerStateChanged {
        from: CircuitState,
        to: CircuitState,
    },
}

/// Shared event channel with a bounded replay buffer.
#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<AdmissionEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish, ignoring the no-subscriber case.
    pub fn publish(&self, event: AdmissionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdmissionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(256)
    }
}
