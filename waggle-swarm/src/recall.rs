//! Semantic recall of past executions
//!
//! Completed task outcomes are stored with an embedding so later work can
//! ask "what did we do last time something like this came up". The index
//! is behind [`AnnIndex`]; the bundled [`LinearScanIndex`] is exact and
//! O(n·d) per query, fine for in-process swarms. Deployments with large
//! histories plug in an approximate index (HNSW-style, ~O(log n) expected
//! search) through the same trait.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use waggle_core::TaskId;
use waggle_task::Task;

/// Nearest-neighbor index over task embeddings.
pub trait AnnIndex: Send + Sync {
    fn insert(&self, id: TaskId, embedding: Vec<f32>);
    /// Ranked `(id, similarity)` with similarity descending.
    fn search(&self, query: &[f32], k: usize) -> Vec<(TaskId, f32)>;
    fn remove(&self, id: TaskId);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exact cosine-similarity scan.
#[derive(Default)]
pub struct LinearScanIndex {
    entries: RwLock<Vec<(TaskId, Vec<f32>)>>,
}

impl LinearScanIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

impl AnnIndex for LinearScanIndex {
    fn insert(&self, id: TaskId, embedding: Vec<f32>) {
        let mut entries = self.entries.write();
        entries.retain(|(existing, _)| *existing != id);
        entries.push((id, embedding));
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(TaskId, f32)> {
        let entries = self.entries.read();
        let mut scored: Vec<(TaskId, f32)> = entries
            .iter()
            .filter(|(_, e)| e.len() == query.len())
            .map(|(id, e)| (*id, Self::cosine(query, e)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
    }

    fn remove(&self, id: TaskId) {
        self.entries.write().retain(|(existing, _)| *existing != id);
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// What recall returns about a past execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallRecord {
    pub task: TaskId,
    pub title: String,
    pub task_type: String,
    pub output: Option<serde_json::Value>,
}

/// Store of past executions with semantic lookup.
pub struct ExecutionRecall {
    index: Arc<dyn AnnIndex>,
    records: DashMap<TaskId, RecallRecord>,
}

impl ExecutionRecall {
    pub fn new(index: Arc<dyn AnnIndex>) -> Self {
        Self {
            index,
            records: DashMap::new(),
        }
    }

    /// Remember a completed task under its embedding.
    pub fn record(&self, task: &Task, embedding: Vec<f32>) {
        self.records.insert(
            task.id,
            RecallRecord {
                task: task.id,
                title: task.title.clone(),
                task_type: task.task_type.clone(),
                output: task.output.clone(),
            },
        );
        self.index.insert(task.id, embedding);
    }

    /// Nearest past executions with their similarity.
    pub fn recall(&self, query: &[f32], k: usize) -> Vec<(RecallRecord, f32)> {
        self.index
            .search(query, k)
            .into_iter()
            .filter_map(|(id, score)| {
                self.records.get(&id).map(|r| (r.clone(), score))
            })
            .collect()
    }

    pub fn forget(&self, id: TaskId) {
        self.records.remove(&id);
        self.index.remove(id);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waggle_task::TaskRequest;

    fn completed_task(title: &str) -> Task {
        let mut task = Task::from_request(TaskRequest::new(title, "", "code"), 3).unwrap();
        task.enqueue().unwrap();
        task.assign(waggle_core::AgentId::new()).unwrap();
        task.start().unwrap();
        task.complete(serde_json::json!({"out": title})).unwrap();
        task
    }

    #[test]
    fn test_recall_ranks_by_similarity() {
        let recall = ExecutionRecall::new(Arc::new(LinearScanIndex::new()));
        let parse = completed_task("parse config");
        let deploy = completed_task("deploy service");
        recall.record(&parse, vec![1.0, 0.0, 0.0]);
        recall.record(&deploy, vec![0.0, 1.0, 0.0]);

        let hits = recall.recall(&[0.9, 0.1, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.title, "parse config");
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_reinsert_replaces_embedding() {
        let index = LinearScanIndex::new();
        let id = TaskId::new();
        index.insert(id, vec![1.0, 0.0]);
        index.insert(id, vec![0.0, 1.0]);
        assert_eq!(index.len(), 1);

        let hits = index.search(&[0.0, 1.0], 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_forget_removes_both_sides() {
        let recall = ExecutionRecall::new(Arc::new(LinearScanIndex::new()));
        let task = completed_task("t");
        recall.record(&task, vec![1.0]);
        recall.forget(task.id);
        assert!(recall.is_empty());
        assert!(recall.recall(&[1.0], 1).is_empty());
    }

    #[test]
    fn test_dimension_mismatch_filtered() {
        let index = LinearScanIndex::new();
        index.insert(TaskId::new(), vec![1.0, 0.0]);
        assert!(index.search(&[1.0, 0.0, 0.0], 5).is_empty());
    }
}
