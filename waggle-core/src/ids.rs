//! Identifier newtypes
//!
//! Each entity family gets its own uuid-backed id so a `TaskId` can never be
//! handed to an API expecting an `AgentId`. Ids are stable for the process
//! lifetime and serialize transparently as uuid strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Failure to parse an identifier from its string form.
#[derive(Error, Debug)]
#[error("invalid {kind} id: {source}")]
pub struct IdParseError {
    kind: &'static str,
    #[source]
    source: uuid::Error,
}

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Mint a fresh task id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string form.
    pub fn parse_str(s: &str) -> Result<Self, IdParseError> {
        Uuid::parse_str(s).map(Self).map_err(|source| IdParseError {
            kind: "task",
            source,
        })
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Mint a fresh agent id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string form.
    pub fn parse_str(s: &str) -> Result<Self, IdParseError> {
        Uuid::parse_str(s).map(Self).map_err(|source| IdParseError {
            kind: "agent",
            source,
        })
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a leader-issued directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectiveId(pub Uuid);

impl DirectiveId {
    /// Mint a fresh directive id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DirectiveId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DirectiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a consensus proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(pub Uuid);

impl ProposalId {
    /// Mint a fresh proposal id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProposalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new();
        let parsed = TaskId::parse_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TaskId::parse_str("not-a-uuid").is_err());
        assert!(AgentId::parse_str("").is_err());
    }

    #[test]
    fn test_serde_transparent() {
        let id = AgentId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }

    #[test]
    fn test_ids_are_distinct() {
        assert_ne!(TaskId::new(), TaskId::new());
    }
}
