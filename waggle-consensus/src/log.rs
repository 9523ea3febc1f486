//! Append-only consensus log
//!
//! Every decided value lands here as `(term, sequence, digest, value)`.
//! Appends are validated against the last entry: terms never decrease and
//! `(term, sequence)` is strictly increasing, which serializes writes under
//! the current leader's term.

use crate::error::{ConsensusError, ConsensusResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One decided entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub sequence: u64,
    pub digest: Vec<u8>,
    pub value: Vec<u8>,
    pub decided_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(term: u64, sequence: u64, digest: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            term,
            sequence,
            digest,
            value,
            decided_at: Utc::now(),
        }
    }
}

fn validate_order(last: Option<&LogEntry>, entry: &LogEntry) -> ConsensusResult<()> {
    if let Some(last) = last {
        if entry.term < last.term {
            return Err(ConsensusError::LogRejected(format!(
                "term {} precedes logged term {}",
                entry.term, last.term
            )));
        }
        if entry.term == last.term && entry.sequence <= last.sequence {
            return Err(ConsensusError::LogRejected(format!(
                "sequence {} not after {} in term {}",
                entry.sequence, last.sequence, entry.term
            )));
        }
    }
    Ok(())
}

/// Append-only log storage.
pub trait ConsensusLog: Send + Sync {
    fn append(&self, entry: LogEntry) -> ConsensusResult<()>;
    fn last(&self) -> ConsensusResult<Option<LogEntry>>;
    fn entries(&self) -> ConsensusResult<Vec<LogEntry>>;
    fn len(&self) -> ConsensusResult<usize>;
    fn is_empty(&self) -> ConsensusResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory log.
#[derive(Default)]
pub struct MemoryConsensusLog {
    entries: RwLock<Vec<LogEntry>>,
}

impl MemoryConsensusLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsensusLog for MemoryConsensusLog {
    fn append(&self, entry: LogEntry) -> ConsensusResult<()> {
        let mut entries = self.entries.write();
        validate_order(entries.last(), &entry)?;
        entries.push(entry);
        Ok(())
    }

    fn last(&self) -> ConsensusResult<Option<LogEntry>> {
        Ok(self.entries.read().last().cloned())
    }

    fn entries(&self) -> ConsensusResult<Vec<LogEntry>> {
        Ok(self.entries.read().clone())
    }

    fn len(&self) -> ConsensusResult<usize> {
        Ok(self.entries.read().len())
    }
}

/// Sled-backed log keyed by a zero-padded monotone index.
pub struct SledConsensusLog {
    tree: sled::Tree,
    /// Guards the read-validate-append sequence.
    write_gate: parking_lot::Mutex<()>,
}

impl SledConsensusLog {
    pub fn open<P: AsRef<Path>>(path: P) -> ConsensusResult<Self> {
        let db = sled::open(path).map_err(|e| ConsensusError::Storage(e.to_string()))?;
        let tree = db
            .open_tree("consensus-log")
            .map_err(|e| ConsensusError::Storage(e.to_string()))?;
        Ok(Self {
            tree,
            write_gate: parking_lot::Mutex::new(()),
        })
    }

    fn decode(value: &[u8]) -> ConsensusResult<LogEntry> {
        serde_json::from_slice(value).map_err(|e| ConsensusError::Storage(e.to_string()))
    }
}

impl ConsensusLog for SledConsensusLog {
    fn append(&self, entry: LogEntry) -> ConsensusResult<()> {
        let _gate = self.write_gate.lock();

        let last = match self
            .tree
            .last()
            .map_err(|e| ConsensusError::Storage(e.to_string()))?
        {
            Some((_, value)) => Some(Self::decode(&value)?),
            None => None,
        };
        validate_order(last.as_ref(), &entry)?;

        let index = self.tree.len() as u64;
        let key = format!("{:020}", index);
        let value =
            serde_json::to_vec(&entry).map_err(|e| ConsensusError::Storage(e.to_string()))?;
        self.tree
            .insert(key.as_bytes(), value)
            .map_err(|e| ConsensusError::Storage(e.to_string()))?;
        Ok(())
    }

    fn last(&self) -> ConsensusResult<Option<LogEntry>> {
        match self
            .tree
            .last()
            .map_err(|e| ConsensusError::Storage(e.to_string()))?
        {
            Some((_, value)) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }

    fn entries(&self) -> ConsensusResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for result in self.tree.iter() {
            let (_, value) = result.map_err(|e| ConsensusError::Storage(e.to_string()))?;
            entries.push(Self::decode(&value)?);
        }
        Ok(entries)
    }

    fn len(&self) -> ConsensusResult<usize> {
        Ok(self.tree.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pbft::digest_value;

    fn entry(term: u64, sequence: u64) -> LogEntry {
        LogEntry::new(term, sequence, digest_value(b"v"), b"v".to_vec())
    }

    #[test]
    fn test_append_enforces_order() {
        let log = MemoryConsensusLog::new();
        log.append(entry(1, 1)).unwrap();
        log.append(entry(1, 2)).unwrap();
        log.append(entry(2, 1)).unwrap(); // new term restarts sequences

        assert!(log.append(entry(1, 9)).is_err()); // old term
        assert!(log.append(entry(2, 1)).is_err()); // replayed sequence
        assert_eq!(log.len().unwrap(), 3);
    }

    #[test]
    fn test_sled_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = SledConsensusLog::open(dir.path()).unwrap();

        log.append(entry(1, 1)).unwrap();
        log.append(entry(1, 2)).unwrap();
        assert!(log.append(entry(1, 2)).is_err());

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(log.last().unwrap().unwrap().sequence, 2);
    }
}
