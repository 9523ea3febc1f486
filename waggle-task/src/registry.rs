//! Agent registry
//!
//! One record per registered agent: capability tags, load, health, and the
//! last heartbeat. Each agent owns its own record between heartbeats; the
//! registry is the single writer per agent id.

use crate::error::{TaskError, TaskResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use waggle_core::AgentId;

/// Agent availability as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Degraded,
    Failed,
    Offline,
}

/// Rolling execution counters per agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// Public snapshot of one agent's record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    /// Fraction of capacity in use, in [0, 1].
    pub load: f64,
    /// Composite health, in [0, 1].
    pub health_score: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub max_concurrent: u32,
    pub metrics: AgentMetrics,
}

struct AgentRecord {
    info: AgentInfo,
    /// Monotonic twin of `last_heartbeat`, used for timeout sweeps and
    /// selection tie-breaks.
    heartbeat_at: Instant,
}

/// Registry of live agents keyed by id.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new agent with its capability tags.
    pub fn register(
        &self,
        id: AgentId,
        capabilities: BTreeSet<String>,
        max_concurrent: u32,
    ) -> TaskResult<()> {
        let mut agents = self.agents.write();
        if agents.contains_key(&id) {
            return Err(TaskError::AgentAlreadyRegistered(id));
        }
        agents.insert(
            id,
            AgentRecord {
                info: AgentInfo {
                    id,
                    capabilities,
                    status: AgentStatus::Idle,
                    load: 0.0,
                    health_score: 1.0,
                    last_heartbeat: Utc::now(),
                    max_concurrent: max_concurrent.max(1),
                    metrics: AgentMetrics::default(),
                },
                heartbeat_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn unregister(&self, id: AgentId) -> TaskResult<()> {
        match self.agents.write().remove(&id) {
            Some(_) => Ok(()),
            None => Err(TaskError::AgentNotFound(id)),
        }
    }

    /// Record a heartbeat carrying the agent's current health score.
    /// Status is rederived: score < 0.3 failed, < 0.6 degraded, otherwise
    /// idle or busy by load.
    pub fn heartbeat(&self, id: AgentId, health_score: f64) -> TaskResult<()> {
        let mut agents = self.agents.write();
        let record = agents.get_mut(&id).ok_or(TaskError::AgentNotFound(id))?;
        record.info.health_score = health_score.clamp(0.0, 1.0);
        record.info.last_heartbeat = Utc::now();
        record.heartbeat_at = Instant::now();
        record.info.status = Self::derive_status(&record.info);
        Ok(())
    }

    /// Mark agents silent for longer than `timeout` offline; returns them.
    pub fn sweep_offline(&self, timeout: Duration) -> Vec<AgentId> {
        self.sweep_offline_at(timeout, Instant::now())
    }

    pub fn sweep_offline_at(&self, timeout: Duration, now: Instant) -> Vec<AgentId> {
        let mut agents = self.agents.write();
        let mut timed_out = Vec::new();
        for record in agents.values_mut() {
            if record.info.status != AgentStatus::Offline
                && now.saturating_duration_since(record.heartbeat_at) > timeout
            {
                record.info.status = AgentStatus::Offline;
                timed_out.push(record.info.id);
            }
        }
        timed_out
    }

    /// Add to an agent's load, clamped to [0, 1], rederiving status.
    pub fn add_load(&self, id: AgentId, delta: f64) -> TaskResult<()> {
        self.adjust_load(id, delta)
    }

    pub fn release_load(&self, id: AgentId, delta: f64) -> TaskResult<()> {
        self.adjust_load(id, -delta)
    }

    /// Expected cost of one task on this agent: an even share of its
    /// concurrent capacity.
    pub fn expected_cost(&self, id: AgentId) -> TaskResult<f64> {
        let agents = self.agents.read();
        let record = agents.get(&id).ok_or(TaskError::AgentNotFound(id))?;
        Ok(1.0 / record.info.max_concurrent as f64)
    }

    pub fn record_completion(&self, id: AgentId, success: bool) {
        if let Some(record) = self.agents.write().get_mut(&id) {
            if success {
                record.info.metrics.tasks_completed += 1;
            } else {
                record.info.metrics.tasks_failed += 1;
            }
        }
    }

    pub fn get(&self, id: AgentId) -> Option<AgentInfo> {
        self.agents.read().get(&id).map(|r| r.info.clone())
    }

    pub fn all(&self) -> Vec<AgentInfo> {
        self.agents.read().values().map(|r| r.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Pick the best agent for a capability set: healthy (score > 0.5,
    /// idle or busy), capabilities intersecting, sorted by load ascending,
    /// then health descending, then earliest heartbeat.
    pub fn select_agent(&self, required: &BTreeSet<String>) -> Option<AgentId> {
        let agents = self.agents.read();
        let mut candidates: Vec<&AgentRecord> = agents
            .values()
            .filter(|r| {
                matches!(r.info.status, AgentStatus::Idle | AgentStatus::Busy)
                    && r.info.health_score > 0.5
                    && !r.info.capabilities.is_disjoint(required)
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.info
                .load
                .total_cmp(&b.info.load)
                .then(b.info.health_score.total_cmp(&a.info.health_score))
                .then(a.heartbeat_at.cmp(&b.heartbeat_at))
        });

        candidates.first().map(|r| r.info.id)
    }

    fn adjust_load(&self, id: AgentId, delta: f64) -> TaskResult<()> {
        let mut agents = self.agents.write();
        let record = agents.get_mut(&id).ok_or(TaskError::AgentNotFound(id))?;
        record.info.load = (record.info.load + delta).clamp(0.0, 1.0);
        if matches!(record.info.status, AgentStatus::Idle | AgentStatus::Busy) {
            record.info.status = Self::derive_status(&record.info);
        }
        Ok(())
    }

    fn derive_status(info: &AgentInfo) -> AgentStatus {
        if info.health_score < 0.3 {
            AgentStatus::Failed
        } else if info.health_score < 0.6 {
            AgentStatus::Degraded
        } else if info.load == 0.0 {
            AgentStatus::Idle
        } else {
            AgentStatus::Busy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_register_and_duplicate() {
        let registry = AgentRegistry::new();
        let id = AgentId::new();
        registry.register(id, caps(&["code"]), 4).unwrap();
        assert!(matches!(
            registry.register(id, caps(&["code"]), 4),
            Err(TaskError::AgentAlreadyRegistered(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_selection_filters_capability_and_health() {
        let registry = AgentRegistry::new();
        let coder = AgentId::new();
        let reviewer = AgentId::new();
        let sick = AgentId::new();
        registry.register(coder, caps(&["code"]), 4).unwrap();
        registry.register(reviewer, caps(&["review"]), 4).unwrap();
        registry.register(sick, caps(&["code"]), 4).unwrap();
        registry.heartbeat(sick, 0.4).unwrap(); // degraded, filtered out

        assert_eq!(registry.select_agent(&caps(&["code"])), Some(coder));
        assert_eq!(registry.select_agent(&caps(&["review"])), Some(reviewer));
        assert_eq!(registry.select_agent(&caps(&["deploy"])), None);
    }

    #[test]
    fn test_selection_prefers_lower_load() {
        let registry = AgentRegistry::new();
        let busy = AgentId::new();
        let idle = AgentId::new();
        registry.register(busy, caps(&["code"]), 4).unwrap();
        registry.register(idle, caps(&["code"]), 4).unwrap();
        registry.add_load(busy, 0.5).unwrap();

        assert_eq!(registry.select_agent(&caps(&["code"])), Some(idle));
    }

    #[test]
    fn test_load_derives_status() {
        let registry = AgentRegistry::new();
        let id = AgentId::new();
        registry.register(id, caps(&["code"]), 4).unwrap();
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Idle);

        registry.add_load(id, 0.25).unwrap();
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Busy);

        registry.release_load(id, 0.25).unwrap();
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn test_sweep_marks_offline() {
        let registry = AgentRegistry::new();
        let id = AgentId::new();
        registry.register(id, caps(&["code"]), 4).unwrap();

        let later = Instant::now() + Duration::from_secs(30);
        let timed_out = registry.sweep_offline_at(Duration::from_secs(10), later);
        assert_eq!(timed_out, vec![id]);
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Offline);

        // Offline agents never match selection.
        assert_eq!(registry.select_agent(&caps(&["code"])), None);

        // A new heartbeat revives the agent.
        registry.heartbeat(id, 1.0).unwrap();
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn test_expected_cost_is_capacity_share() {
        let registry = AgentRegistry::new();
        let id = AgentId::new();
        registry.register(id, caps(&["code"]), 4).unwrap();
        assert!((registry.expected_cost(id).unwrap() - 0.25).abs() < f64::EPSILON);
    }
}
