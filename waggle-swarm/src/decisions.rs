//! Collective decisions
//!
//! The queen opens a decision and solicits ballots over the message bus.
//! Byzantine decisions are proxied through the consensus engine's PBFT
//! protocol: the proposal becomes the leader replica's pre-prepare, an
//! approving ballot becomes that voter's accepted pre-prepare, and the
//! resulting prepare and commit messages flow through every replica until
//! `2f + 1` distinct commits decide the round. Decided values land in the
//! append-only decision log. The simpler classes (majority, supermajority,
//! unanimous, weighted) are tallied directly by the queen.

use crate::bus::{MessageBus, WorkerMessage};
use crate::error::{SwarmError, SwarmResult};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use waggle_consensus::{
    pbft::digest_value, tally_votes, BftMessage, BftNode, ByzantineParams, ConsensusError,
    ConsensusKind, ConsensusLog, ConsensusProposal, DecisionOutcome, LogEntry, ProposalPhase,
    ProposalVote, VoteKind,
};
use waggle_core::{AgentId, ProposalId};

/// Per-round PBFT state for a Byzantine decision. One replica per eligible
/// voter; the lowest voter id doubles as the proposing leader on the
/// queen's behalf.
struct ByzantineRound {
    /// Ballot choice that matches the proposed value.
    canonical: String,
    digest: Vec<u8>,
    /// The leader node's sequence for this round.
    sequence: u64,
    pre_prepare: BftMessage,
    leader: String,
    nodes: BTreeMap<String, BftNode>,
}

impl ByzantineRound {
    /// Commits counted by the leader replica for this round's digest.
    fn committers(&self) -> usize {
        self.nodes
            .get(&self.leader)
            .map_or(0, |node| node.commit_count(self.sequence, &self.digest))
    }
}

struct DecisionRecord {
    proposal: ConsensusProposal,
    kind: ConsensusKind,
    eligible: BTreeSet<AgentId>,
    ballots: BTreeMap<String, String>,
    weights: BTreeMap<String, f64>,
    deadline: Instant,
    outcome: Option<DecisionOutcome>,
    byzantine: Option<ByzantineRound>,
}

/// Runs collective decisions for the queen.
pub struct DecisionDriver {
    decisions: DashMap<ProposalId, DecisionRecord>,
    log: Arc<dyn ConsensusLog>,
    bus: Arc<MessageBus>,
    params: ByzantineParams,
    sequence: AtomicU64,
}

impl DecisionDriver {
    pub fn new(log: Arc<dyn ConsensusLog>, bus: Arc<MessageBus>, params: ByzantineParams) -> Self {
        Self {
            decisions: DashMap::new(),
            log,
            bus,
            params,
            sequence: AtomicU64::new(0),
        }
    }

    /// Open a decision among `eligible` voters and solicit their ballots
    /// over the bus. A Byzantine decision validates `n ≥ 3f + 1`, spins up
    /// one replica per voter, and pre-prepares the proposal through the
    /// leader replica.
    pub async fn open(
        &self,
        kind: ConsensusKind,
        value: serde_json::Value,
        eligible: BTreeSet<AgentId>,
        weights: BTreeMap<String, f64>,
        deadline: Instant,
        view: u64,
    ) -> SwarmResult<ProposalId> {
        if eligible.is_empty() {
            return Err(SwarmError::InvalidConfig("decision has no voters".into()));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut proposal = ConsensusProposal::new(view, sequence, value.clone());
        let id = proposal.id;

        let byzantine = if matches!(kind, ConsensusKind::Byzantine) {
            let params = ByzantineParams::with_tolerance(eligible.len(), self.params.f)
                .map_err(SwarmError::Consensus)?;
            Some(Self::open_round(&mut proposal, &value, &eligible, params)?)
        } else {
            None
        };

        self.decisions.insert(
            id,
            DecisionRecord {
                proposal,
                kind,
                eligible: eligible.clone(),
                ballots: BTreeMap::new(),
                weights,
                deadline,
                outcome: None,
                byzantine,
            },
        );
        debug!(decision = %id, ?kind, "decision opened");

        let time_budget = deadline.saturating_duration_since(Instant::now());
        let results = self
            .bus
            .broadcast(
                &eligible,
                WorkerMessage::VoteRequest {
                    decision: id,
                    value,
                    time_budget,
                },
            )
            .await;
        for (target, result) in results {
            if result.is_err() {
                debug!(decision = %id, voter = %target, "vote solicitation undeliverable");
            }
        }
        Ok(id)
    }

    /// Cast one voter's ballot. For Byzantine decisions an approving
    /// ballot runs the voter's replica through the prepare/commit phases;
    /// a first ballot is final. Returns the outcome once the decision
    /// settles, `None` while it is still open.
    pub fn cast_vote(
        &self,
        id: ProposalId,
        voter: AgentId,
        choice: impl Into<String>,
    ) -> SwarmResult<Option<DecisionOutcome>> {
        self.cast_vote_at(id, voter, choice, Instant::now())
    }

    pub fn cast_vote_at(
        &self,
        id: ProposalId,
        voter: AgentId,
        choice: impl Into<String>,
        now: Instant,
    ) -> SwarmResult<Option<DecisionOutcome>> {
        let mut record = self
            .decisions
            .get_mut(&id)
            .ok_or(SwarmError::DecisionNotFound(id))?;

        if record.outcome.is_some() {
            return Ok(record.outcome.clone());
        }
        if now >= record.deadline {
            return Ok(Some(Self::abort(&mut record, id)));
        }
        if !record.eligible.contains(&voter) {
            warn!(decision = %id, voter = %voter, "ballot from ineligible voter ignored");
            return Ok(None);
        }

        let choice = choice.into();
        if record.byzantine.is_some() {
            self.cast_byzantine(&mut record, id, voter, choice)
        } else {
            Self::cast_tallied(&mut record, id, voter, choice)
        }
    }

    /// Accept a commit message that arrived from outside the queen's own
    /// replicas (a remote or adversarial node). A commit whose digest does
    /// not match the pre-prepared value is Byzantine behavior.
    pub fn receive_commit(
        &self,
        id: ProposalId,
        commit: &BftMessage,
    ) -> SwarmResult<Option<DecisionOutcome>> {
        let mut guard = self
            .decisions
            .get_mut(&id)
            .ok_or(SwarmError::DecisionNotFound(id))?;
        if guard.outcome.is_some() {
            return Ok(guard.outcome.clone());
        }
        let record = &mut *guard;
        let Some(round) = record.byzantine.as_mut() else {
            return Err(SwarmError::InvalidConfig(
                "commit messages only apply to byzantine decisions".into(),
            ));
        };

        let BftMessage::Commit {
            sequence,
            digest,
            replica,
            ..
        } = commit
        else {
            return Err(SwarmError::Consensus(ConsensusError::ByzantineDetected(
                "expected commit message".into(),
            )));
        };
        if *sequence != round.sequence || *digest != round.digest {
            warn!(decision = %id, replica = %replica, "conflicting commit digest");
            return Err(SwarmError::Consensus(ConsensusError::ByzantineDetected(
                format!("conflicting commit digest from {}", replica),
            )));
        }

        let decided = Self::deliver_commits(round, std::slice::from_ref(commit))
            .map_err(SwarmError::Consensus)?;
        record.proposal.record_vote(
            replica.clone(),
            ProposalVote {
                kind: VoteKind::Commit,
                signature: None,
            },
        );
        Self::enter_phase(&mut record.proposal, ProposalPhase::Commit);

        if decided {
            return Ok(Some(self.settle_byzantine(record, id, true)));
        }
        Ok(None)
    }

    /// Abort decisions whose deadline passed; returns the affected ids.
    pub fn expire(&self) -> Vec<ProposalId> {
        self.expire_at(Instant::now())
    }

    pub fn expire_at(&self, now: Instant) -> Vec<ProposalId> {
        let mut expired = Vec::new();
        for mut record in self.decisions.iter_mut() {
            if record.outcome.is_none() && now >= record.deadline {
                let id = record.proposal.id;
                Self::abort(&mut record, id);
                expired.push(id);
            }
        }
        expired
    }

    pub fn outcome(&self, id: ProposalId) -> SwarmResult<Option<DecisionOutcome>> {
        Ok(self
            .decisions
            .get(&id)
            .ok_or(SwarmError::DecisionNotFound(id))?
            .outcome
            .clone())
    }

    pub fn phase(&self, id: ProposalId) -> SwarmResult<ProposalPhase> {
        Ok(self
            .decisions
            .get(&id)
            .ok_or(SwarmError::DecisionNotFound(id))?
            .proposal
            .phase)
    }

    /// Build the PBFT round: one replica per voter, the lowest voter id as
    /// leader, and the proposal pre-prepared through it. The pre-prepare
    /// doubles as the leader's prepare.
    fn open_round(
        proposal: &mut ConsensusProposal,
        value: &serde_json::Value,
        eligible: &BTreeSet<AgentId>,
        params: ByzantineParams,
    ) -> SwarmResult<ByzantineRound> {
        let leader = eligible
            .iter()
            .next()
            .map(|id| id.to_string())
            .ok_or_else(|| SwarmError::InvalidConfig("decision has no voters".into()))?;

        let mut nodes = BTreeMap::new();
        for voter in eligible {
            let node_id = voter.to_string();
            let is_leader = node_id == leader;
            nodes.insert(node_id.clone(), BftNode::new(node_id, params, is_leader));
        }

        let canonical = Self::canonical_choice(value);
        let leader_node = nodes
            .get_mut(&leader)
            .ok_or_else(|| SwarmError::Internal("leader replica missing".into()))?;
        let pre_prepare = leader_node
            .pre_prepare(canonical.clone().into_bytes())
            .map_err(SwarmError::Consensus)?;

        let (sequence, digest) = match &pre_prepare {
            BftMessage::PrePrepare {
                sequence, digest, ..
            } => (*sequence, digest.clone()),
            _ => return Err(SwarmError::Internal("pre-prepare expected".into())),
        };

        proposal.record_vote(
            leader.clone(),
            ProposalVote {
                kind: VoteKind::Prepare,
                signature: None,
            },
        );

        Ok(ByzantineRound {
            canonical,
            digest,
            sequence,
            pre_prepare,
            leader,
            nodes,
        })
    }

    /// Byzantine ballot: an approval accepts the pre-prepare on the
    /// voter's replica and drives the resulting prepare and commits
    /// through every node; anything else is a rejection.
    fn cast_byzantine(
        &self,
        record: &mut DecisionRecord,
        id: ProposalId,
        voter: AgentId,
        choice: String,
    ) -> SwarmResult<Option<DecisionOutcome>> {
        let voter_id = voter.to_string();
        if record.ballots.contains_key(&voter_id) {
            // A prepare cannot be withdrawn; the first ballot stands.
            return Ok(None);
        }
        record.ballots.insert(voter_id.clone(), choice.clone());

        let round = record
            .byzantine
            .as_mut()
            .ok_or_else(|| SwarmError::Internal("byzantine round missing".into()))?;

        if choice != round.canonical {
            record.proposal.record_vote(
                voter_id,
                ProposalVote {
                    kind: VoteKind::Reject,
                    signature: None,
                },
            );
        } else if voter_id != round.leader {
            let pre_prepare = round.pre_prepare.clone();
            let replica = round
                .nodes
                .get_mut(&voter_id)
                .ok_or_else(|| SwarmError::Internal("voter replica missing".into()))?;
            let prepare = replica
                .handle_pre_prepare(&pre_prepare)
                .map_err(SwarmError::Consensus)?;

            record.proposal.record_vote(
                voter_id,
                ProposalVote {
                    kind: VoteKind::Prepare,
                    signature: None,
                },
            );
            Self::enter_phase(&mut record.proposal, ProposalPhase::Prepare);

            let commits =
                Self::deliver_prepare(round, &prepare).map_err(SwarmError::Consensus)?;
            for commit in &commits {
                if let BftMessage::Commit { replica, .. } = commit {
                    record.proposal.record_vote(
                        replica.clone(),
                        ProposalVote {
                            kind: VoteKind::Commit,
                            signature: None,
                        },
                    );
                }
            }
            if !commits.is_empty() {
                Self::enter_phase(&mut record.proposal, ProposalPhase::Commit);
            }

            let decided =
                Self::deliver_commits(round, &commits).map_err(SwarmError::Consensus)?;
            if decided {
                return Ok(Some(self.settle_byzantine(record, id, true)));
            }
        }
        // The leader's own ballot adds nothing: its pre-prepare already
        // counts as its prepare.

        if record.ballots.len() == record.eligible.len() {
            // Everyone voted and the commit quorum never formed.
            return Ok(Some(self.settle_byzantine(record, id, false)));
        }
        Ok(None)
    }

    /// Non-Byzantine ballot: record and tally. Weighted decisions compare
    /// fractions of cast weight, so they only settle once every ballot is
    /// in; the count-based classes settle as soon as the quorum is met.
    fn cast_tallied(
        record: &mut DecisionRecord,
        id: ProposalId,
        voter: AgentId,
        choice: String,
    ) -> SwarmResult<Option<DecisionOutcome>> {
        let kind = record.kind;
        record.ballots.insert(voter.to_string(), choice);
        record.proposal.record_vote(
            voter.to_string(),
            ProposalVote {
                kind: VoteKind::Commit,
                signature: None,
            },
        );

        let outcome = tally_votes(
            kind,
            record.eligible.len(),
            &record.ballots,
            Some(&record.weights),
        );
        let all_in = record.ballots.len() == record.eligible.len();
        let early_quorum = outcome.consensus && !matches!(kind, ConsensusKind::Weighted { .. });

        if early_quorum || all_in {
            if outcome.consensus {
                record.proposal.decide();
                info!(decision = %id, choice = ?outcome.final_choice, "decision reached");
            } else {
                record.proposal.abort();
            }
            record.outcome = Some(outcome.clone());
            return Ok(Some(outcome));
        }
        Ok(None)
    }

    /// Deliver one prepare to every replica, collecting the commits of
    /// whoever crossed the prepare quorum.
    fn deliver_prepare(
        round: &mut ByzantineRound,
        prepare: &BftMessage,
    ) -> Result<Vec<BftMessage>, ConsensusError> {
        let mut commits = Vec::new();
        for node in round.nodes.values_mut() {
            if let Some(commit) = node.handle_prepare(prepare)? {
                commits.push(commit);
            }
        }
        Ok(commits)
    }

    /// Deliver commits to every replica; true once any replica decides.
    fn deliver_commits(
        round: &mut ByzantineRound,
        commits: &[BftMessage],
    ) -> Result<bool, ConsensusError> {
        let mut decided = false;
        for commit in commits {
            for node in round.nodes.values_mut() {
                if node.handle_commit(commit)?.is_some() {
                    decided = true;
                }
            }
        }
        Ok(decided)
    }

    /// Settle a Byzantine round. Approval counts the leader's distinct
    /// committers; participation counts cast ballots.
    fn settle_byzantine(
        &self,
        record: &mut DecisionRecord,
        id: ProposalId,
        consensus: bool,
    ) -> DecisionOutcome {
        let eligible = record.eligible.len();
        let cast = record.ballots.len();
        let (committers, canonical) = record
            .byzantine
            .as_ref()
            .map(|round| (round.committers(), round.canonical.clone()))
            .unwrap_or_default();

        let outcome = DecisionOutcome {
            consensus,
            final_choice: consensus.then(|| canonical),
            approval_rate: committers as f64 / eligible as f64,
            participation_rate: cast as f64 / eligible as f64,
            confidence_score: if cast == 0 {
                0.0
            } else {
                committers as f64 / cast as f64
            },
        };

        if consensus {
            record.proposal.decide();
            self.log_decision(&record.proposal, &outcome);
            info!(decision = %id, commits = committers, "byzantine decision reached");
        } else {
            record.proposal.abort();
            warn!(decision = %id, commits = committers, "byzantine decision failed quorum");
        }
        record.outcome = Some(outcome.clone());
        outcome
    }

    fn abort(record: &mut DecisionRecord, id: ProposalId) -> DecisionOutcome {
        record.proposal.abort();
        let outcome = DecisionOutcome::aborted();
        record.outcome = Some(outcome.clone());
        warn!(decision = %id, "decision aborted on deadline");
        outcome
    }

    fn enter_phase(proposal: &mut ConsensusProposal, phase: ProposalPhase) {
        if !proposal.is_settled() {
            proposal.phase = phase;
        }
    }

    /// Byzantine outcomes are durable: append to the consensus log.
    fn log_decision(&self, proposal: &ConsensusProposal, outcome: &DecisionOutcome) {
        let Some(choice) = &outcome.final_choice else {
            return;
        };
        let entry = LogEntry::new(
            proposal.view,
            proposal.sequence,
            digest_value(choice.as_bytes()),
            choice.clone().into_bytes(),
        );
        if let Err(e) = self.log.append(entry) {
            warn!(decision = %proposal.id, error = %e, "decision log append failed");
        }
    }

    /// The ballot string an approving voter must cast for this value.
    fn canonical_choice(value: &serde_json::Value) -> String {
        match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        }
    }
}
