//! Core swarm types

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;
use waggle_core::{AgentId, DirectiveId, Priority, TaskId};

/// What a directive asks of its targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveType {
    /// Execute a scheduled task.
    Task { task: TaskId },
    /// Answer a query without mutating task state.
    Query,
    /// Coordination traffic between queen and workers.
    Coordination,
    /// Solicit a vote in a collective decision.
    Consensus,
}

/// Directive lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
    Aborted,
}

/// A leader-issued unit of work, at-most-once per id.
#[derive(Debug, Clone)]
pub struct Directive {
    pub id: DirectiveId,
    pub directive_type: DirectiveType,
    pub targets: BTreeSet<AgentId>,
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Capability tags a replacement worker must carry on reassignment.
    pub required_capabilities: BTreeSet<String>,
    /// Distinct results needed before the directive completes.
    pub required_responses: usize,
    pub deadline: Instant,
    pub status: DirectiveStatus,
}

impl Directive {
    /// Two thirds of the targets, at least one.
    pub fn required_responses_for(targets: usize) -> usize {
        ((2 * targets).div_ceil(3)).max(1)
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            DirectiveStatus::Completed | DirectiveStatus::Failed | DirectiveStatus::Aborted
        )
    }
}

/// Raw worker health signals reported with each heartbeat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerSignals {
    /// CPU utilization in [0, 1].
    pub cpu: f64,
    /// Memory utilization in [0, 1].
    pub memory: f64,
    /// Recent error rate in [0, 1].
    pub error_rate: f64,
    /// Mean response time in milliseconds.
    pub response_time_ms: f64,
}

impl WorkerSignals {
    pub fn healthy() -> Self {
        Self {
            cpu: 0.0,
            memory: 0.0,
            error_rate: 0.0,
            response_time_ms: 0.0,
        }
    }

    /// Composite health in [0, 1]: equal parts CPU headroom, memory
    /// headroom, success rate, and responsiveness (10 s response time
    /// scores zero).
    pub fn health_score(&self) -> f64 {
        let cpu = 1.0 - self.cpu.clamp(0.0, 1.0);
        let memory = 1.0 - self.memory.clamp(0.0, 1.0);
        let success = 1.0 - self.error_rate.clamp(0.0, 1.0);
        let responsiveness = 1.0 - (self.response_time_ms / 10_000.0).clamp(0.0, 1.0);
        ((cpu + memory + success + responsiveness) / 4.0).clamp(0.0, 1.0)
    }
}

/// Aggregate swarm health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmHealthSnapshot {
    pub total_workers: usize,
    pub healthy_workers: usize,
    /// Healthy fraction in [0, 1].
    pub overall_health: f64,
    /// Whether the healthy set still clears the Byzantine quorum.
    pub has_quorum: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_responses_two_thirds() {
        assert_eq!(Directive::required_responses_for(1), 1);
        assert_eq!(Directive::required_responses_for(2), 2);
        assert_eq!(Directive::required_responses_for(3), 2);
        assert_eq!(Directive::required_responses_for(6), 4);
        assert_eq!(Directive::required_responses_for(0), 1);
    }

    #[test]
    fn test_health_score_blends_signals() {
        assert!((WorkerSignals::healthy().health_score() - 1.0).abs() < 1e-9);

        let loaded = WorkerSignals {
            cpu: 1.0,
            memory: 1.0,
            error_rate: 1.0,
            response_time_ms: 10_000.0,
        };
        assert!(loaded.health_score() < 1e-9);

        let mixed = WorkerSignals {
            cpu: 0.5,
            memory: 0.5,
            error_rate: 0.0,
            response_time_ms: 0.0,
        };
        assert!((mixed.health_score() - 0.75).abs() < 1e-9);
    }
}
