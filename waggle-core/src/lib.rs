//! Shared leaf types for the Waggle orchestration runtime
//!
//! Everything here is dependency-light on purpose: the clock, the identifier
//! newtypes, and the priority ordering are consumed by every other crate in
//! the workspace.

pub mod clock;
pub mod ids;
pub mod priority;

pub use clock::Clock;
pub use ids::{AgentId, DirectiveId, IdParseError, ProposalId, TaskId};
pub use priority::Priority;
