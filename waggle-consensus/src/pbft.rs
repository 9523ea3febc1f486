//! Byzantine voting
//!
//! PBFT-style three-phase protocol. The leader broadcasts a pre-prepare
//! carrying `(view, sequence, digest, value)`; a replica that accepts it
//! broadcasts prepare; after `2f` matching prepares it broadcasts commit;
//! after `2f + 1` matching commits it decides. Vote counts track distinct
//! senders, so an equivocating node cannot inflate a quorum.

use crate::error::{ConsensusError, ConsensusResult};
use crate::quorum::ByzantineParams;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BftMessage {
    PrePrepare {
        view: u64,
        sequence: u64,
        digest: Vec<u8>,
        value: Vec<u8>,
        leader: String,
    },
    Prepare {
        view: u64,
        sequence: u64,
        digest: Vec<u8>,
        replica: String,
    },
    Commit {
        view: u64,
        sequence: u64,
        digest: Vec<u8>,
        replica: String,
    },
    ViewChange {
        new_view: u64,
        node: String,
    },
}

/// Digest binding a proposal value.
pub fn digest_value(value: &[u8]) -> Vec<u8> {
    Sha256::digest(value).to_vec()
}

type Round = (u64, Vec<u8>);

/// One replica's protocol state.
pub struct BftNode {
    node_id: String,
    params: ByzantineParams,
    view: u64,
    sequence: u64,
    is_leader: bool,
    /// Accepted pre-prepare values by (sequence, digest).
    values: DashMap<Round, Vec<u8>>,
    /// Distinct prepare senders by (sequence, digest).
    prepares: DashMap<Round, BTreeSet<String>>,
    /// Distinct commit senders by (sequence, digest).
    commits: DashMap<Round, BTreeSet<String>>,
    /// Rounds for which this node already sent its commit.
    commit_sent: DashMap<Round, ()>,
    /// Decided value per sequence.
    decided: DashMap<u64, Vec<u8>>,
}

impl BftNode {
    pub fn new(node_id: impl Into<String>, params: ByzantineParams, is_leader: bool) -> Self {
        Self {
            node_id: node_id.into(),
            params,
            view: 0,
            sequence: 0,
            is_leader,
            values: DashMap::new(),
            prepares: DashMap::new(),
            commits: DashMap::new(),
            commit_sent: DashMap::new(),
            decided: DashMap::new(),
        }
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn params(&self) -> ByzantineParams {
        self.params
    }

    /// Leader proposes a value, opening a new sequence. The pre-prepare
    /// doubles as the leader's own prepare.
    pub fn pre_prepare(&mut self, value: Vec<u8>) -> ConsensusResult<BftMessage> {
        if !self.is_leader {
            return Err(ConsensusError::NotLeader);
        }

        self.sequence += 1;
        let sequence = self.sequence;
        let digest = digest_value(&value);
        let round = (sequence, digest.clone());

        self.values.insert(round.clone(), value.clone());
        self.prepares
            .entry(round)
            .or_default()
            .insert(self.node_id.clone());

        debug!(node = %self.node_id, sequence, view = self.view, "pre-prepare");
        Ok(BftMessage::PrePrepare {
            view: self.view,
            sequence,
            digest,
            value,
            leader: self.node_id.clone(),
        })
    }

    /// Replica accepts a pre-prepare, answering with its prepare.
    pub fn handle_pre_prepare(&mut self, message: &BftMessage) -> ConsensusResult<BftMessage> {
        let BftMessage::PrePrepare {
            view,
            sequence,
            digest,
            value,
            leader,
        } = message
        else {
            return Err(ConsensusError::ByzantineDetected(
                "expected pre-prepare".into(),
            ));
        };

        if *view != self.view {
            return Err(ConsensusError::InvalidView {
                expected: self.view,
                actual: *view,
            });
        }
        if digest_value(value) != *digest {
            warn!(node = %self.node_id, leader = %leader, "digest mismatch in pre-prepare");
            return Err(ConsensusError::ByzantineDetected(format!(
                "digest mismatch from leader {}",
                leader
            )));
        }

        let round = (*sequence, digest.clone());
        self.values.insert(round.clone(), value.clone());
        // The leader's pre-prepare counts as its prepare.
        let mut senders = self.prepares.entry(round).or_default();
        senders.insert(leader.clone());
        senders.insert(self.node_id.clone());
        drop(senders);

        self.sequence = self.sequence.max(*sequence);
        Ok(BftMessage::Prepare {
            view: self.view,
            sequence: *sequence,
            digest: digest.clone(),
            replica: self.node_id.clone(),
        })
    }

    /// Record a prepare. Once `2f` distinct replicas besides ourselves
    /// agree, broadcast our commit (at most once per round).
    pub fn handle_prepare(&mut self, message: &BftMessage) -> ConsensusResult<Option<BftMessage>> {
        let BftMessage::Prepare {
            view,
            sequence,
            digest,
            replica,
        } = message
        else {
            return Err(ConsensusError::ByzantineDetected("expected prepare".into()));
        };
        if *view != self.view {
            return Err(ConsensusError::InvalidView {
                expected: self.view,
                actual: *view,
            });
        }

        let round = (*sequence, digest.clone());
        let count = {
            let mut senders = self.prepares.entry(round.clone()).or_default();
            senders.insert(replica.clone());
            senders.len()
        };

        if count >= self.params.prepare_quorum() + 1 && !self.commit_sent.contains_key(&round) {
            self.commit_sent.insert(round, ());
            debug!(node = %self.node_id, sequence, prepares = count, "commit threshold reached");
            return Ok(Some(BftMessage::Commit {
                view: self.view,
                sequence: *sequence,
                digest: digest.clone(),
                replica: self.node_id.clone(),
            }));
        }
        Ok(None)
    }

    /// Record a commit. Returns the decided value once `2f + 1` distinct
    /// replicas committed the same digest.
    pub fn handle_commit(&mut self, message: &BftMessage) -> ConsensusResult<Option<Vec<u8>>> {
        let BftMessage::Commit {
            view,
            sequence,
            digest,
            replica,
        } = message
        else {
            return Err(ConsensusError::ByzantineDetected("expected commit".into()));
        };
        if *view != self.view {
            return Err(ConsensusError::InvalidView {
                expected: self.view,
                actual: *view,
            });
        }

        let round = (*sequence, digest.clone());
        let count = {
            let mut senders = self.commits.entry(round.clone()).or_default();
            senders.insert(replica.clone());
            senders.len()
        };

        if count >= self.params.commit_quorum() && !self.decided.contains_key(sequence) {
            let Some(value) = self.values.get(&round).map(|v| v.clone()) else {
                // Commits arrived before the pre-prepare; wait for it.
                return Ok(None);
            };
            self.decided.insert(*sequence, value.clone());
            info!(node = %self.node_id, sequence, commits = count, "decided");
            return Ok(Some(value));
        }
        Ok(None)
    }

    /// This node's own commit message for a round, once prepared.
    pub fn own_commit(&self, sequence: u64, digest: Vec<u8>) -> BftMessage {
        BftMessage::Commit {
            view: self.view,
            sequence,
            digest,
            replica: self.node_id.clone(),
        }
    }

    pub fn decided_value(&self, sequence: u64) -> Option<Vec<u8>> {
        self.decided.get(&sequence).map(|v| v.clone())
    }

    /// Commit count for a round, for outcome reporting.
    pub fn commit_count(&self, sequence: u64, digest: &[u8]) -> usize {
        self.commits
            .get(&(sequence, digest.to_vec()))
            .map_or(0, |s| s.len())
    }

    /// Move to a strictly newer view, dropping leadership until reassigned.
    pub fn view_change(&mut self, new_view: u64) -> ConsensusResult<BftMessage> {
        if new_view <= self.view {
            return Err(ConsensusError::InvalidView {
                expected: self.view + 1,
                actual: new_view,
            });
        }
        self.view = new_view;
        self.is_leader = false;
        warn!(node = %self.node_id, new_view, "view change");
        Ok(BftMessage::ViewChange {
            new_view,
            node: self.node_id.clone(),
        })
    }

    pub fn set_leader(&mut self, is_leader: bool) {
        self.is_leader = is_leader;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive a full round across `n` in-process replicas; returns nodes.
    fn run_round(n: usize, faulty: usize) -> Vec<BftNode> {
        let params = ByzantineParams::new(n);
        let mut nodes: Vec<BftNode> = (0..n)
            .map(|i| BftNode::new(format!("node{}", i), params, i == 0))
            .collect();

        let pre_prepare = nodes[0].pre_prepare(b"value".to_vec()).unwrap();

        // Honest replicas (skip `faulty` of them, never the leader) prepare.
        let mut prepares = Vec::new();
        for node in nodes.iter_mut().skip(1 + faulty) {
            prepares.push(node.handle_pre_prepare(&pre_prepare).unwrap());
        }

        // Everyone sees every prepare; collect commits.
        let mut commits = Vec::new();
        let honest: Vec<usize> = std::iter::once(0)
            .chain(1 + faulty..n)
            .collect();
        for prepare in &prepares {
            for &i in &honest {
                if let Some(commit) = nodes[i].handle_prepare(prepare).unwrap() {
                    commits.push(commit);
                }
            }
        }

        // Everyone sees every commit.
        for commit in &commits {
            for &i in &honest {
                nodes[i].handle_commit(commit).unwrap();
            }
        }
        nodes
    }

    #[test]
    fn test_four_nodes_one_fault_decides() {
        let nodes = run_round(4, 1);
        // The three honest nodes all decide the proposed value.
        assert_eq!(nodes[0].decided_value(1), Some(b"value".to_vec()));
        assert_eq!(nodes[2].decided_value(1), Some(b"value".to_vec()));
        assert_eq!(nodes[3].decided_value(1), Some(b"value".to_vec()));
        // The silent node never saw the round through.
        assert_eq!(nodes[1].decided_value(1), None);
    }

    #[test]
    fn test_too_many_faults_never_decides() {
        // n=4 tolerates f=1; two silent nodes starve the commit quorum.
        let nodes = run_round(4, 2);
        for node in &nodes {
            assert_eq!(node.decided_value(1), None);
        }
    }

    #[test]
    fn test_non_leader_cannot_propose() {
        let params = ByzantineParams::new(4);
        let mut node = BftNode::new("node1", params, false);
        assert!(matches!(
            node.pre_prepare(b"v".to_vec()),
            Err(ConsensusError::NotLeader)
        ));
    }

    #[test]
    fn test_tampered_value_detected() {
        let params = ByzantineParams::new(4);
        let mut leader = BftNode::new("node0", params, true);
        let mut replica = BftNode::new("node1", params, false);

        let mut message = leader.pre_prepare(b"v".to_vec()).unwrap();
        if let BftMessage::PrePrepare { value, .. } = &mut message {
            *value = b"tampered".to_vec();
        }
        assert!(matches!(
            replica.handle_pre_prepare(&message),
            Err(ConsensusError::ByzantineDetected(_))
        ));
    }

    #[test]
    fn test_wrong_view_rejected() {
        let params = ByzantineParams::new(4);
        let mut leader = BftNode::new("node0", params, true);
        let mut replica = BftNode::new("node1", params, false);
        replica.view_change(1).unwrap();

        let message = leader.pre_prepare(b"v".to_vec()).unwrap();
        assert!(matches!(
            replica.handle_pre_prepare(&message),
            Err(ConsensusError::InvalidView { .. })
        ));
    }

    #[test]
    fn test_duplicate_votes_do_not_inflate_quorum() {
        let params = ByzantineParams::new(4);
        let mut node = BftNode::new("node3", params, false);

        let digest = digest_value(b"v");
        let prepare = BftMessage::Prepare {
            view: 0,
            sequence: 1,
            digest: digest.clone(),
            replica: "node1".into(),
        };
        // The same replica preparing thrice counts once, far below the
        // 2f+1 = 3 distinct senders needed to commit.
        assert!(node.handle_prepare(&prepare).unwrap().is_none());
        assert!(node.handle_prepare(&prepare).unwrap().is_none());
        assert!(node.handle_prepare(&prepare).unwrap().is_none());
    }
}
