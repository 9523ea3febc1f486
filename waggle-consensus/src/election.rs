//! Leader election
//!
//! Majority election with monotone terms. A node votes at most once per
//! term; a candidate that collects strictly more than half the cluster
//! becomes leader and suppresses elections with heartbeats. Split votes
//! resolve through a randomized backoff before the next attempt.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Election role of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Follower,
    Candidate,
    Leader,
}

/// Vote solicitation from a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: String,
}

/// A follower's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub voter: String,
    pub granted: bool,
}

/// Leader liveness signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub term: u64,
    pub leader: String,
}

/// Election timing and membership.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub node_id: String,
    /// Peers, not including this node.
    pub peers: Vec<String>,
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Split-vote backoff bounds in milliseconds.
const TIE_BACKOFF_MIN_MS: u64 = 500;
const TIE_BACKOFF_MAX_MS: u64 = 1_500;

/// One node's election state machine. Message transport is external: the
/// caller delivers requests, responses, and heartbeats and broadcasts
/// whatever this node returns.
pub struct ElectionNode {
    config: ElectionConfig,
    state: ElectionState,
    term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    votes_received: BTreeSet<String>,
    deadline: Instant,
}

impl ElectionNode {
    pub fn new(config: ElectionConfig) -> Self {
        let deadline = Instant::now() + Self::randomized_timeout(config.election_timeout);
        Self {
            config,
            state: ElectionState::Follower,
            term: 0,
            voted_for: None,
            leader_id: None,
            votes_received: BTreeSet::new(),
            deadline,
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn is_leader(&self) -> bool {
        self.state == ElectionState::Leader
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn cluster_size(&self) -> usize {
        self.config.peers.len() + 1
    }

    /// Strictly more than half of the cluster.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Drive timers: absent a heartbeat by the deadline, start an election
    /// and return the vote request to broadcast.
    pub fn tick(&mut self) -> Option<VoteRequest> {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> Option<VoteRequest> {
        if self.state == ElectionState::Leader || now < self.deadline {
            return None;
        }

        // A candidate timing out means a split vote: back off randomly.
        let backoff = if self.state == ElectionState::Candidate {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(TIE_BACKOFF_MIN_MS..=TIE_BACKOFF_MAX_MS))
        } else {
            Self::randomized_timeout(self.config.election_timeout)
        };

        self.term += 1;
        self.state = ElectionState::Candidate;
        self.voted_for = Some(self.config.node_id.clone());
        self.leader_id = None;
        self.votes_received = BTreeSet::from([self.config.node_id.clone()]);
        self.deadline = now + backoff;

        // A cluster of one elects itself on the spot.
        if self.votes_received.len() >= self.majority() {
            self.state = ElectionState::Leader;
            self.leader_id = Some(self.config.node_id.clone());
            info!(node = %self.config.node_id, term = self.term, "became leader");
            return None;
        }

        debug!(node = %self.config.node_id, term = self.term, "election started");
        Some(VoteRequest {
            term: self.term,
            candidate: self.config.node_id.clone(),
        })
    }

    /// Grant a vote iff the candidate's term is at least ours and we have
    /// not voted in that term.
    pub fn handle_vote_request(&mut self, request: &VoteRequest) -> VoteResponse {
        self.handle_vote_request_at(request, Instant::now())
    }

    pub fn handle_vote_request_at(&mut self, request: &VoteRequest, now: Instant) -> VoteResponse {
        if request.term > self.term {
            self.step_down(request.term);
        }

        let granted = request.term >= self.term
            && self
                .voted_for
                .as_deref()
                .map_or(true, |v| v == request.candidate);

        if granted {
            self.voted_for = Some(request.candidate.clone());
            self.deadline = now + Self::randomized_timeout(self.config.election_timeout);
        }

        VoteResponse {
            term: self.term,
            voter: self.config.node_id.clone(),
            granted,
        }
    }

    /// Count a vote; returns true when this node just won the election.
    pub fn handle_vote_response(&mut self, response: &VoteResponse) -> bool {
        if response.term > self.term {
            self.step_down(response.term);
            return false;
        }
        if self.state != ElectionState::Candidate
            || !response.granted
            || response.term != self.term
        {
            return false;
        }

        self.votes_received.insert(response.voter.clone());
        if self.votes_received.len() >= self.majority() {
            self.state = ElectionState::Leader;
            self.leader_id = Some(self.config.node_id.clone());
            info!(node = %self.config.node_id, term = self.term, "became leader");
            return true;
        }
        false
    }

    /// Leader's periodic liveness broadcast.
    pub fn heartbeat(&self) -> Option<Heartbeat> {
        if self.state == ElectionState::Leader {
            Some(Heartbeat {
                term: self.term,
                leader: self.config.node_id.clone(),
            })
        } else {
            None
        }
    }

    /// Accept a heartbeat from a current-or-newer leader.
    pub fn handle_heartbeat(&mut self, heartbeat: &Heartbeat) {
        self.handle_heartbeat_at(heartbeat, Instant::now());
    }

    pub fn handle_heartbeat_at(&mut self, heartbeat: &Heartbeat, now: Instant) {
        if heartbeat.term < self.term {
            return; // stale leader
        }
        if heartbeat.term > self.term {
            self.step_down(heartbeat.term);
        } else if self.state != ElectionState::Follower {
            // Same term: another node won; defer to it.
            self.state = ElectionState::Follower;
        }
        self.leader_id = Some(heartbeat.leader.clone());
        self.deadline = now + Self::randomized_timeout(self.config.election_timeout);
    }

    fn step_down(&mut self, term: u64) {
        self.term = term;
        self.state = ElectionState::Follower;
        self.voted_for = None;
        self.votes_received.clear();
    }

    /// Timeout with up-to-100% jitter so simultaneous elections are rare.
    fn randomized_timeout(base: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        base + Duration::from_secs_f64(base.as_secs_f64() * rng.gen_range(0.0..1.0))
    }
}
