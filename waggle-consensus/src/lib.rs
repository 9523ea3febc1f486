//! Consensus engine
//!
//! Two protocols behind one crate: majority leader election for picking the
//! queen, and PBFT-style three-phase voting for Byzantine-tolerant
//! collective decisions. Quorum arithmetic for the simpler decision classes
//! (majority, supermajority, unanimous, weighted) lives in [`quorum`], the
//! tally that turns votes into an outcome in [`decision`], and the
//! append-only decision log in [`log`].

pub mod decision;
pub mod election;
pub mod error;
pub mod log;
pub mod pbft;
pub mod proposal;
pub mod quorum;

pub use decision::{tally_votes, DecisionOutcome};
pub use election::{ElectionConfig, ElectionNode, ElectionState, Heartbeat, VoteRequest, VoteResponse};
pub use error::{ConsensusError, ConsensusResult};
pub use log::{ConsensusLog, LogEntry, MemoryConsensusLog, SledConsensusLog};
pub use pbft::{BftMessage, BftNode};
pub use proposal::{ConsensusProposal, ProposalPhase, ProposalVote, VoteKind};
pub use quorum::{ByzantineParams, ConsensusKind};
