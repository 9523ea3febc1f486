//! Queen
//!
//! Hosts leader state and the directive table. Directives go out only while
//! this node holds leadership, at most once per id; results are counted
//! until the required quorum of responses arrives or the deadline passes.
//! Workers that go silent get their unanswered directives reassigned to
//! another healthy capable worker, or failed when none exists.

use crate::bus::{MessageBus, WorkerMessage};
use crate::error::{SwarmError, SwarmResult};
use crate::types::{Directive, DirectiveStatus, DirectiveType};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use waggle_consensus::{ElectionConfig, ElectionNode, VoteRequest};
use waggle_core::{AgentId, DirectiveId, Priority, TaskId};
use waggle_task::{AgentRegistry, AgentStatus};

struct DirectiveRecord {
    directive: Directive,
    responses: BTreeMap<AgentId, serde_json::Value>,
}

/// The swarm's coordinating process.
pub struct Queen {
    node_id: String,
    election: Mutex<ElectionNode>,
    registry: Arc<AgentRegistry>,
    bus: Arc<MessageBus>,
    directives: DashMap<DirectiveId, DirectiveRecord>,
}

impl Queen {
    pub fn new(
        node_id: impl Into<String>,
        peers: Vec<String>,
        election_timeout: Duration,
        heartbeat_interval: Duration,
        registry: Arc<AgentRegistry>,
        bus: Arc<MessageBus>,
    ) -> Self {
        let node_id = node_id.into();
        let election = ElectionNode::new(ElectionConfig {
            node_id: node_id.clone(),
            peers,
            election_timeout,
            heartbeat_interval,
        });
        Self {
            node_id,
            election: Mutex::new(election),
            registry,
            bus,
            directives: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.election.lock().is_leader()
    }

    pub fn term(&self) -> u64 {
        self.election.lock().term()
    }

    /// Drive the election timer; returns a vote request to broadcast when
    /// an election starts (a single-node cluster elects itself directly).
    pub fn tick_leadership(&self) -> Option<VoteRequest> {
        self.election.lock().tick()
    }

    /// Issue a directive to a set of workers. Leader only, at most once
    /// per id.
    #[instrument(skip(self, payload, required_capabilities))]
    pub async fn issue_directive(
        &self,
        directive_type: DirectiveType,
        targets: BTreeSet<AgentId>,
        payload: serde_json::Value,
        priority: Priority,
        required_capabilities: BTreeSet<String>,
        time_budget: Duration,
    ) -> SwarmResult<DirectiveId> {
        if !self.is_leader() {
            return Err(SwarmError::NotLeader);
        }
        if targets.is_empty() {
            return Err(SwarmError::InvalidConfig("directive has no targets".into()));
        }

        let directive = Directive {
            id: DirectiveId::new(),
            directive_type,
            required_responses: Directive::required_responses_for(targets.len()),
            targets,
            payload,
            priority,
            required_capabilities,
            deadline: Instant::now() + time_budget,
            status: DirectiveStatus::Pending,
        };
        let id = directive.id;

        let message = Self::message_for(&directive, time_budget);
        let targets = directive.targets.clone();
        self.directives.insert(
            id,
            DirectiveRecord {
                directive,
                responses: BTreeMap::new(),
            },
        );

        let results = self.bus.broadcast(&targets, message).await;
        let delivered = results.iter().filter(|(_, r)| r.is_ok()).count();

        let mut record = self
            .directives
            .get_mut(&id)
            .ok_or(SwarmError::DirectiveNotFound(id))?;
        record.directive.status = if delivered == 0 {
            warn!(directive = %id, "directive reached no targets");
            DirectiveStatus::Failed
        } else {
            DirectiveStatus::Dispatched
        };

        info!(directive = %id, delivered, "directive issued");
        Ok(id)
    }

    /// Count a worker's result. Results from offline workers and settled
    /// directives are dropped without mutating anything.
    pub fn record_response(
        &self,
        id: DirectiveId,
        worker: AgentId,
        payload: serde_json::Value,
    ) -> SwarmResult<DirectiveStatus> {
        let mut record = self
            .directives
            .get_mut(&id)
            .ok_or(SwarmError::DirectiveNotFound(id))?;

        if record.directive.is_settled() {
            debug!(directive = %id, worker = %worker, "response after settlement ignored");
            return Ok(record.directive.status.clone());
        }
        if matches!(
            self.registry.get(worker).map(|info| info.status),
            Some(AgentStatus::Offline) | None
        ) {
            warn!(directive = %id, worker = %worker, "late response from offline worker ignored");
            return Ok(record.directive.status.clone());
        }

        record.responses.insert(worker, payload);
        if record.responses.len() >= record.directive.required_responses {
            record.directive.status = DirectiveStatus::Completed;
            info!(directive = %id, "directive completed");
        }
        Ok(record.directive.status.clone())
    }

    /// Abort directives whose deadline has passed.
    pub fn check_deadlines(&self) -> Vec<DirectiveId> {
        self.check_deadlines_at(Instant::now())
    }

    pub fn check_deadlines_at(&self, now: Instant) -> Vec<DirectiveId> {
        let mut aborted = Vec::new();
        for mut record in self.directives.iter_mut() {
            if !record.directive.is_settled() && now >= record.directive.deadline {
                record.directive.status = DirectiveStatus::Aborted;
                aborted.push(record.directive.id);
            }
        }
        for id in &aborted {
            warn!(directive = %id, "directive aborted on deadline");
        }
        aborted
    }

    /// Reassign the unanswered directives of an offline worker. Returns
    /// `(directive, replacement)` per affected directive; `None` means the
    /// directive failed for lack of a capable worker.
    pub async fn handle_worker_offline(
        &self,
        worker: AgentId,
    ) -> Vec<(DirectiveId, Option<AgentId>)> {
        // Collect retargets first; bus sends happen outside the map guards.
        let mut actions: Vec<(DirectiveId, Option<AgentId>, Option<WorkerMessage>)> = Vec::new();

        for mut record in self.directives.iter_mut() {
            let needs_replacement = !record.directive.is_settled()
                && record.directive.targets.contains(&worker)
                && !record.responses.contains_key(&worker);
            if !needs_replacement {
                continue;
            }

            let replacement = self.pick_replacement(
                &record.directive.required_capabilities,
                &record.directive.targets,
            );
            match replacement {
                Some(candidate) => {
                    record.directive.targets.remove(&worker);
                    record.directive.targets.insert(candidate);
                    let remaining = record
                        .directive
                        .deadline
                        .saturating_duration_since(Instant::now());
                    let message = Self::message_for(&record.directive, remaining);
                    warn!(
                        directive = %record.directive.id,
                        from = %worker,
                        to = %candidate,
                        "directive reassigned"
                    );
                    actions.push((record.directive.id, Some(candidate), Some(message)));
                }
                None => {
                    record.directive.status = DirectiveStatus::Failed;
                    warn!(directive = %record.directive.id, "no replacement worker, directive failed");
                    actions.push((record.directive.id, None, None));
                }
            }
        }

        let mut outcomes = Vec::with_capacity(actions.len());
        for (id, replacement, message) in actions {
            if let (Some(candidate), Some(message)) = (replacement, message) {
                if self.bus.send(candidate, message).await.is_err() {
                    warn!(directive = %id, to = %candidate, "reassignment delivery failed");
                }
            }
            outcomes.push((id, replacement));
        }
        outcomes
    }

    /// Settle the directives carrying a task once its result has been
    /// applied, so the deadline sweep does not abort finished work.
    pub fn settle_task_directives(&self, task: TaskId) {
        for mut record in self.directives.iter_mut() {
            let carries_task = matches!(
                record.directive.directive_type,
                DirectiveType::Task { task: t } if t == task
            );
            if carries_task && !record.directive.is_settled() {
                record.directive.status = DirectiveStatus::Completed;
            }
        }
    }

    pub fn directive(&self, id: DirectiveId) -> Option<Directive> {
        self.directives.get(&id).map(|r| r.directive.clone())
    }

    pub fn directive_status(&self, id: DirectiveId) -> Option<DirectiveStatus> {
        self.directives.get(&id).map(|r| r.directive.status.clone())
    }

    pub fn responses(&self, id: DirectiveId) -> Option<BTreeMap<AgentId, serde_json::Value>> {
        self.directives.get(&id).map(|r| r.responses.clone())
    }

    fn message_for(directive: &Directive, time_budget: Duration) -> WorkerMessage {
        WorkerMessage::Directive {
            id: directive.id,
            task: match directive.directive_type {
                DirectiveType::Task { task } => Some(task),
                _ => None,
            },
            payload: directive.payload.clone(),
            priority: directive.priority,
            time_budget,
        }
    }

    /// A healthy capable worker outside the current target set, preferring
    /// low load, high health, and the longest-quiet heartbeat.
    fn pick_replacement(
        &self,
        required: &BTreeSet<String>,
        exclude: &BTreeSet<AgentId>,
    ) -> Option<AgentId> {
        let mut candidates: Vec<_> = self
            .registry
            .all()
            .into_iter()
            .filter(|info| {
                matches!(info.status, AgentStatus::Idle | AgentStatus::Busy)
                    && info.health_score > 0.5
                    && !exclude.contains(&info.id)
                    && (required.is_empty() || !info.capabilities.is_disjoint(required))
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.load
                .total_cmp(&b.load)
                .then(b.health_score.total_cmp(&a.health_score))
                .then(a.last_heartbeat.cmp(&b.last_heartbeat))
        });
        candidates.first().map(|info| info.id)
    }
}
