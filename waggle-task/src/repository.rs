//! Task storage seam
//!
//! The scheduler depends only on [`TaskRepository`]; an in-memory map backs
//! tests and single-process deployments, a sled tree backs durable ones.
//! `save` is atomic per task and `save_many` is all-or-nothing.

use crate::error::{TaskError, TaskResult};
use crate::task::{Task, TaskStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use sled::transaction::ConflictableTransactionError;
use std::collections::BTreeMap;
use std::path::Path;
use waggle_core::TaskId;

/// Per-status breakdown of stored tasks.
#[derive(Debug, Clone, Default)]
pub struct RepositoryStats {
    pub total: usize,
    pub by_status: BTreeMap<TaskStatus, usize>,
}

/// Durable task store.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn save(&self, task: &Task) -> TaskResult<()>;
    /// All-or-nothing batch save.
    async fn save_many(&self, tasks: &[Task]) -> TaskResult<()>;
    async fn find_by_id(&self, id: TaskId) -> TaskResult<Option<Task>>;
    async fn find_by_status(&self, status: TaskStatus) -> TaskResult<Vec<Task>>;
    /// Returns the tasks that exist; missing ids are simply absent.
    async fn find_by_ids(&self, ids: &[TaskId]) -> TaskResult<Vec<Task>>;
    async fn delete(&self, id: TaskId) -> TaskResult<bool>;
    async fn exists(&self, id: TaskId) -> TaskResult<bool>;
    async fn count(&self) -> TaskResult<usize>;
    async fn clear(&self) -> TaskResult<()>;
    async fn statistics(&self) -> TaskResult<RepositoryStats>;
}

/// In-memory repository over a concurrent map.
#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: DashMap<TaskId, Task>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn save(&self, task: &Task) -> TaskResult<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn save_many(&self, tasks: &[Task]) -> TaskResult<()> {
        for task in tasks {
            self.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    async fn find_by_id(&self, id: TaskId) -> TaskResult<Option<Task>> {
        Ok(self.tasks.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_by_status(&self, status: TaskStatus) -> TaskResult<Vec<Task>> {
        Ok(self
            .tasks
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_by_ids(&self, ids: &[TaskId]) -> TaskResult<Vec<Task>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|entry| entry.value().clone()))
            .collect())
    }

    async fn delete(&self, id: TaskId) -> TaskResult<bool> {
        Ok(self.tasks.remove(&id).is_some())
    }

    async fn exists(&self, id: TaskId) -> TaskResult<bool> {
        Ok(self.tasks.contains_key(&id))
    }

    async fn count(&self) -> TaskResult<usize> {
        Ok(self.tasks.len())
    }

    async fn clear(&self) -> TaskResult<()> {
        self.tasks.clear();
        Ok(())
    }

    async fn statistics(&self) -> TaskResult<RepositoryStats> {
        let mut stats = RepositoryStats::default();
        for entry in self.tasks.iter() {
            stats.total += 1;
            *stats.by_status.entry(entry.value().status).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

/// Sled-backed repository with JSON-encoded records.
pub struct SledTaskRepository {
    tree: sled::Tree,
}

impl SledTaskRepository {
    pub fn open<P: AsRef<Path>>(path: P) -> TaskResult<Self> {
        let db = sled::open(path).map_err(|e| TaskError::Storage(e.to_string()))?;
        let tree = db
            .open_tree("tasks")
            .map_err(|e| TaskError::Storage(e.to_string()))?;
        Ok(Self { tree })
    }

    fn key(id: TaskId) -> String {
        format!("task:{}", id)
    }

    fn decode(value: &[u8]) -> TaskResult<Task> {
        serde_json::from_slice(value).map_err(Into::into)
    }
}

#[async_trait]
impl TaskRepository for SledTaskRepository {
    async fn save(&self, task: &Task) -> TaskResult<()> {
        let value = serde_json::to_vec(task)?;
        self.tree
            .insert(Self::key(task.id).as_bytes(), value)
            .map_err(|e| TaskError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn save_many(&self, tasks: &[Task]) -> TaskResult<()> {
        let mut encoded = Vec::with_capacity(tasks.len());
        for task in tasks {
            encoded.push((Self::key(task.id), serde_json::to_vec(task)?));
        }
        self.tree
            .transaction(|tx| {
                for (key, value) in &encoded {
                    tx.insert(key.as_bytes(), value.clone())?;
                }
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|e| TaskError::Storage(format!("batch save failed: {:?}", e)))?;
        Ok(())
    }

    async fn find_by_id(&self, id: TaskId) -> TaskResult<Option<Task>> {
        match self
            .tree
            .get(Self::key(id).as_bytes())
            .map_err(|e| TaskError::Storage(e.to_string()))?
        {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn find_by_status(&self, status: TaskStatus) -> TaskResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for result in self.tree.scan_prefix(b"task:") {
            let (_, value) = result.map_err(|e| TaskError::Storage(e.to_string()))?;
            let task = Self::decode(&value)?;
            if task.status == status {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn find_by_ids(&self, ids: &[TaskId]) -> TaskResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for &id in ids {
            if let Some(task) = self.find_by_id(id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn delete(&self, id: TaskId) -> TaskResult<bool> {
        Ok(self
            .tree
            .remove(Self::key(id).as_bytes())
            .map_err(|e| TaskError::Storage(e.to_string()))?
            .is_some())
    }

    async fn exists(&self, id: TaskId) -> TaskResult<bool> {
        Ok(self
            .tree
            .contains_key(Self::key(id).as_bytes())
            .map_err(|e| TaskError::Storage(e.to_string()))?)
    }

    async fn count(&self) -> TaskResult<usize> {
        Ok(self.tree.len())
    }

    async fn clear(&self) -> TaskResult<()> {
        self.tree
            .clear()
            .map_err(|e| TaskError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn statistics(&self) -> TaskResult<RepositoryStats> {
        let mut stats = RepositoryStats::default();
        for result in self.tree.scan_prefix(b"task:") {
            let (_, value) = result.map_err(|e| TaskError::Storage(e.to_string()))?;
            let task = Self::decode(&value)?;
            stats.total += 1;
            *stats.by_status.entry(task.status).or_insert(0) += 1;
        }
        Ok(stats)
    }
}
