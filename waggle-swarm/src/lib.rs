//! Waggle swarm coordinator
//!
//! The queen hosts leader state, the worker table, and the outbound message
//! bus; directives fan out to workers, heartbeats keep the table honest,
//! and collective decisions run through the consensus engine. The
//! [`runtime::SwarmRuntime`] at the top wires configuration, admission,
//! routing, the task core, and the queen into one process.

pub mod bus;
pub mod decisions;
pub mod error;
pub mod queen;
pub mod recall;
pub mod runtime;
pub mod types;
pub mod worker;

pub use bus::{MessageBus, WorkerMessage};
pub use decisions::DecisionDriver;
pub use error::{SwarmError, SwarmResult};
pub use queen::Queen;
pub use recall::{AnnIndex, ExecutionRecall, LinearScanIndex, RecallRecord};
pub use runtime::SwarmRuntime;
pub use types::{
    Directive, DirectiveStatus, DirectiveType, SwarmHealthSnapshot, WorkerSignals,
};
pub use worker::WorkerHandle;

use tracing::info;

/// Initialize process-wide tracing for swarm deployments.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("waggle swarm tracing initialized");
}
