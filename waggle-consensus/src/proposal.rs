//! Consensus proposal bookkeeping
//!
//! The coordinator-facing record of one collective decision: who voted,
//! how, and which phase the proposal is in. The wire-level protocol state
//! lives in [`crate::pbft`]; this type is what gets logged and reported.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use waggle_core::ProposalId;

/// A voter's position on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Prepare,
    Commit,
    Reject,
}

/// One recorded vote, with an optional opaque signature supplied and
/// verified by the embedding system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalVote {
    pub kind: VoteKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
}

/// Proposal lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalPhase {
    PrePrepare,
    Prepare,
    Commit,
    Decided,
    Aborted,
}

/// A collective decision in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub id: ProposalId,
    pub view: u64,
    pub sequence: u64,
    pub value: serde_json::Value,
    pub votes: BTreeMap<String, ProposalVote>,
    pub phase: ProposalPhase,
}

impl ConsensusProposal {
    pub fn new(view: u64, sequence: u64, value: serde_json::Value) -> Self {
        Self {
            id: ProposalId::new(),
            view,
            sequence,
            value,
            votes: BTreeMap::new(),
            phase: ProposalPhase::PrePrepare,
        }
    }

    /// Record a vote; later votes from the same voter replace earlier ones.
    pub fn record_vote(&mut self, voter: impl Into<String>, vote: ProposalVote) {
        self.votes.insert(voter.into(), vote);
    }

    pub fn count(&self, kind: VoteKind) -> usize {
        self.votes.values().filter(|v| v.kind == kind).count()
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.phase, ProposalPhase::Decided | ProposalPhase::Aborted)
    }

    pub fn decide(&mut self) {
        self.phase = ProposalPhase::Decided;
    }

    /// Abort, typically on timeout.
    pub fn abort(&mut self) {
        self.phase = ProposalPhase::Aborted;
    }
}
