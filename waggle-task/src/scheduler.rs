//! Scheduler
//!
//! Owns every task mutation: submissions, binding ready tasks to capable
//! agents, and applying completion or failure results. Graphs and queues
//! hold ids only; tasks are resolved through the repository on demand.

use crate::error::{TaskError, TaskResult};
use crate::events::{SchedulerEvent, SchedulerEvents};
use crate::graph::TaskGraph;
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::repository::TaskRepository;
use crate::task::{Task, TaskRequest, TaskStatus};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};
use waggle_core::{AgentId, TaskId};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_max_retries: u32,
    pub queue_capacity: usize,
    /// Idle backoff doubles from `base_backoff` up to `max_backoff` while
    /// no ready task can be bound.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            queue_capacity: 1_000,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Binds ready tasks to capable agents and drives task state.
pub struct Scheduler {
    repo: Arc<dyn TaskRepository>,
    registry: Arc<AgentRegistry>,
    graph: Mutex<TaskGraph>,
    queue: TaskQueue,
    events: SchedulerEvents,
    config: SchedulerConfig,
    /// Wakes the scheduling loop when new work or capacity appears.
    kick: tokio::sync::Notify,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        registry: Arc<AgentRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            registry,
            graph: Mutex::new(TaskGraph::new()),
            queue: TaskQueue::new(config.queue_capacity),
            events: SchedulerEvents::default(),
            config,
            kick: tokio::sync::Notify::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> SchedulerEvents {
        self.events.clone()
    }

    /// Accept a submission: create the task, place it in the dependency
    /// graph and the ready queue.
    #[instrument(skip(self, request), fields(title = %request.title))]
    pub async fn submit(&self, request: TaskRequest) -> TaskResult<TaskId> {
        let mut task = Task::from_request(request, self.config.default_max_retries)?;
        task.enqueue()?;

        // Queue first: a full queue rejects the submission before any
        // graph or repository state exists for it.
        self.queue.enqueue(task.id, task.priority)?;
        self.graph.lock().add_task(&task);
        self.repo.save(&task).await?;

        info!(task = %task.id, task_type = %task.task_type, "task submitted");
        self.events
            .publish(SchedulerEvent::TaskSubmitted { task: task.id });
        self.kick.notify_one();
        Ok(task.id)
    }

    pub async fn get_task(&self, id: TaskId) -> TaskResult<Option<Task>> {
        self.repo.find_by_id(id).await
    }

    /// Queued tasks whose blockers have all completed, in drain order.
    pub async fn ready_tasks(&self) -> TaskResult<Vec<Task>> {
        let mut ready = Vec::new();
        for id in self.queue.ids_in_order() {
            if !self.is_blocked(id).await? {
                if let Some(task) = self.repo.find_by_id(id).await? {
                    ready.push(task);
                }
            }
        }
        Ok(ready)
    }

    /// Queued tasks still waiting on at least one blocker.
    pub async fn blocked_tasks(&self) -> TaskResult<Vec<Task>> {
        let mut blocked = Vec::new();
        for id in self.queue.ids_in_order() {
            if self.is_blocked(id).await? {
                if let Some(task) = self.repo.find_by_id(id).await? {
                    blocked.push(task);
                }
            }
        }
        Ok(blocked)
    }

    /// One scheduling round: bind as many ready tasks as agents allow.
    /// Returns the number of assignments made.
    pub async fn schedule_once(&self) -> TaskResult<usize> {
        let mut assigned = 0;
        for id in self.queue.ids_in_order() {
            if self.is_blocked(id).await? {
                continue;
            }
            let Some(mut task) = self.repo.find_by_id(id).await? else {
                // Repository no longer knows this id; drop the stale entry.
                self.queue.remove(id);
                continue;
            };
            if task.status != TaskStatus::Queued {
                self.queue.remove(id);
                continue;
            }

            let required = task.required_capabilities();
            let Some(agent) = self.registry.select_agent(&required) else {
                debug!(task = %id, ?required, "no suitable agent");
                continue;
            };

            self.queue.remove(id);
            task.assign(agent)?;
            let cost = self.registry.expected_cost(agent)?;
            self.registry.add_load(agent, cost)?;
            self.repo.save(&task).await?;

            debug!(task = %id, agent = %agent, "task assigned");
            self.events
                .publish(SchedulerEvent::TaskAssigned { task: id, agent });
            assigned += 1;
        }
        Ok(assigned)
    }

    /// Mark an assigned task as running on its agent.
    pub async fn start_task(&self, id: TaskId) -> TaskResult<()> {
        let mut task = self
            .repo
            .find_by_id(id)
            .await?
            .ok_or(TaskError::NotFound(id))?;
        task.start()?;
        let agent = task
            .assigned_agent
            .ok_or_else(|| TaskError::InvalidArgument("assigned task has no agent".into()))?;
        self.repo.save(&task).await?;
        self.events
            .publish(SchedulerEvent::TaskStarted { task: id, agent });
        Ok(())
    }

    /// Apply a successful result, then re-examine newly unblocked work.
    #[instrument(skip(self, output))]
    pub async fn complete_task(&self, id: TaskId, output: serde_json::Value) -> TaskResult<()> {
        let mut task = self
            .repo
            .find_by_id(id)
            .await?
            .ok_or(TaskError::NotFound(id))?;
        let agent = task.assigned_agent;
        task.complete(output)?;
        self.repo.save(&task).await?;

        if let Some(agent) = agent {
            let cost = self.registry.expected_cost(agent).unwrap_or(0.0);
            let _ = self.registry.release_load(agent, cost);
            self.registry.record_completion(agent, true);
        }

        info!(task = %id, "task completed");
        self.events.publish(SchedulerEvent::TaskCompleted { task: id });

        // Successors may have become ready.
        self.schedule_once().await?;
        Ok(())
    }

    /// Apply a failed result: requeue while retries remain, otherwise fail
    /// terminally.
    #[instrument(skip(self))]
    pub async fn fail_task(&self, id: TaskId, error: &str) -> TaskResult<bool> {
        let mut task = self
            .repo
            .find_by_id(id)
            .await?
            .ok_or(TaskError::NotFound(id))?;
        let agent = task.assigned_agent;
        let will_retry = task.fail(error)?;
        self.repo.save(&task).await?;

        if let Some(agent) = agent {
            let cost = self.registry.expected_cost(agent).unwrap_or(0.0);
            let _ = self.registry.release_load(agent, cost);
            self.registry.record_completion(agent, false);
        }

        if will_retry {
            self.queue.enqueue(id, task.priority)?;
            self.kick.notify_one();
            warn!(task = %id, retry = task.retry_count, "task failed, requeued");
        } else {
            warn!(task = %id, "task failed terminally");
        }
        self.events.publish(SchedulerEvent::TaskFailed {
            task: id,
            error: error.to_string(),
            will_retry,
        });
        Ok(will_retry)
    }

    /// Hand a task bound to a lost worker over to another agent. The task
    /// returns to ASSIGNED (keeping `started_at` if it had begun) so the
    /// replacement can start it; load moves from the old agent to the new.
    pub async fn reassign_task(&self, id: TaskId, new_agent: AgentId) -> TaskResult<()> {
        let mut task = self
            .repo
            .find_by_id(id)
            .await?
            .ok_or(TaskError::NotFound(id))?;
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
            return Err(TaskError::InvalidTransition {
                from: task.status.to_string(),
                to: "assigned".to_string(),
            });
        }

        let old_agent = task.assigned_agent;
        task.status = TaskStatus::Assigned;
        task.assigned_agent = Some(new_agent);
        self.repo.save(&task).await?;

        if let Some(old_agent) = old_agent {
            let cost = self.registry.expected_cost(old_agent).unwrap_or(0.0);
            let _ = self.registry.release_load(old_agent, cost);
        }
        let cost = self.registry.expected_cost(new_agent)?;
        self.registry.add_load(new_agent, cost)?;

        // Delivery to the replacement rides on the directive reassignment,
        // so no assignment event is re-emitted here.
        warn!(task = %id, agent = %new_agent, "task reassigned");
        Ok(())
    }

    /// Cancel a non-terminal task.
    pub async fn cancel_task(&self, id: TaskId, reason: Option<String>) -> TaskResult<()> {
        let mut task = self
            .repo
            .find_by_id(id)
            .await?
            .ok_or(TaskError::NotFound(id))?;
        let agent = task.assigned_agent;
        task.cancel(reason)?;
        self.queue.remove(id);
        self.repo.save(&task).await?;

        if let Some(agent) = agent {
            let cost = self.registry.expected_cost(agent).unwrap_or(0.0);
            let _ = self.registry.release_load(agent, cost);
        }
        self.events.publish(SchedulerEvent::TaskCancelled { task: id });
        Ok(())
    }

    /// Archive a terminal task: remove it from graph and repository.
    pub async fn archive_task(&self, id: TaskId) -> TaskResult<()> {
        let task = self
            .repo
            .find_by_id(id)
            .await?
            .ok_or(TaskError::NotFound(id))?;
        if !task.is_terminal() {
            return Err(TaskError::InvalidArgument(
                "only terminal tasks can be archived".into(),
            ));
        }
        self.graph.lock().remove_task(id);
        self.repo.delete(id).await?;
        Ok(())
    }

    pub fn register_agent(
        &self,
        id: AgentId,
        capabilities: BTreeSet<String>,
        max_concurrent: u32,
    ) -> TaskResult<()> {
        self.registry.register(id, capabilities, max_concurrent)?;
        self.events.publish(SchedulerEvent::AgentRegistered { agent: id });
        self.kick.notify_one();
        Ok(())
    }

    pub fn unregister_agent(&self, id: AgentId) -> TaskResult<()> {
        self.registry.unregister(id)?;
        self.events
            .publish(SchedulerEvent::AgentUnregistered { agent: id });
        Ok(())
    }

    pub fn heartbeat(&self, id: AgentId, health_score: f64) -> TaskResult<()> {
        self.registry.heartbeat(id, health_score)
    }

    /// Sweep for silent agents, emitting a timeout event per victim.
    pub fn sweep_agents(&self, timeout: Duration) -> Vec<AgentId> {
        let timed_out = self.registry.sweep_offline(timeout);
        for &agent in &timed_out {
            warn!(agent = %agent, "agent heartbeat timeout");
            self.events.publish(SchedulerEvent::AgentTimeout { agent });
        }
        timed_out
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        self.registry.clone()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Scheduling loop: bind ready work, backing off exponentially while
    /// nothing can be bound.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.base_backoff;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let assigned = match self.schedule_once().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "scheduling round failed");
                    0
                }
            };
            if assigned > 0 {
                backoff = self.config.base_backoff;
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = self.kick.notified() => {
                    backoff = self.config.base_backoff;
                    continue;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// A task is blocked while any blocker is missing or not COMPLETED.
    async fn is_blocked(&self, id: TaskId) -> TaskResult<bool> {
        let deps = self.graph.lock().dependencies_of(id);
        if deps.is_empty() {
            return Ok(false);
        }
        let dep_ids: Vec<TaskId> = deps.iter().copied().collect();
        let blockers = self.repo.find_by_ids(&dep_ids).await?;
        if blockers.len() < dep_ids.len() {
            return Ok(true);
        }
        Ok(blockers.iter().any(|t| t.status != TaskStatus::Completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryTaskRepository;

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            Arc::new(InMemoryTaskRepository::new()),
            Arc::new(AgentRegistry::new()),
            SchedulerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_retry_then_success_flow() {
        let scheduler = scheduler();
        let agent = AgentId::new();
        scheduler.register_agent(agent, caps(&["code"]), 4).unwrap();

        let id = scheduler
            .submit(TaskRequest::new("t", "d", "CODE").with_max_retries(3))
            .await
            .unwrap();

        // Two failed attempts, then success.
        for _ in 0..2 {
            assert_eq!(scheduler.schedule_once().await.unwrap(), 1);
            scheduler.start_task(id).await.unwrap();
            assert!(scheduler.fail_task(id, "boom").await.unwrap());
        }
        assert_eq!(scheduler.schedule_once().await.unwrap(), 1);
        scheduler.start_task(id).await.unwrap();
        scheduler
            .complete_task(id, serde_json::json!({"out": "ok"}))
            .await
            .unwrap();

        let task = scheduler.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.output, Some(serde_json::json!({"out": "ok"})));

        // Load returned to zero.
        let info = scheduler.registry().get(agent).unwrap();
        assert!(info.load.abs() < 1e-9);
        assert_eq!(info.metrics.tasks_completed, 1);
        assert_eq!(info.metrics.tasks_failed, 2);
    }

    #[tokio::test]
    async fn test_dependency_unblocking() {
        let scheduler = scheduler();

        let t1 = scheduler
            .submit(TaskRequest::new("t1", "", "code"))
            .await
            .unwrap();
        let t2 = scheduler
            .submit(TaskRequest::new("t2", "", "code").blocked_by(t1))
            .await
            .unwrap();

        let ready: Vec<TaskId> = scheduler
            .ready_tasks()
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![t1]);
        let blocked: Vec<TaskId> = scheduler
            .blocked_tasks()
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(blocked, vec![t2]);

        // Drive T1 to completion.
        let agent = AgentId::new();
        scheduler.register_agent(agent, caps(&["code"]), 4).unwrap();
        scheduler.schedule_once().await.unwrap();
        scheduler.start_task(t1).await.unwrap();
        scheduler
            .complete_task(t1, serde_json::json!({}))
            .await
            .unwrap();

        // T2 was picked up by the post-completion round.
        let task2 = scheduler.get_task(t2).await.unwrap().unwrap();
        assert_eq!(task2.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_no_capable_agent_leaves_task_queued() {
        let scheduler = scheduler();
        let agent = AgentId::new();
        scheduler
            .register_agent(agent, caps(&["review"]), 4)
            .unwrap();

        let id = scheduler
            .submit(TaskRequest::new("t", "", "code"))
            .await
            .unwrap();
        assert_eq!(scheduler.schedule_once().await.unwrap(), 0);
        let task = scheduler.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_failed_blocker_keeps_dependents_blocked() {
        let scheduler = scheduler();
        let agent = AgentId::new();
        scheduler.register_agent(agent, caps(&["code"]), 4).unwrap();

        let t1 = scheduler
            .submit(TaskRequest::new("t1", "", "code").with_max_retries(0))
            .await
            .unwrap();
        let t2 = scheduler
            .submit(TaskRequest::new("t2", "", "code").blocked_by(t1))
            .await
            .unwrap();

        scheduler.schedule_once().await.unwrap();
        scheduler.start_task(t1).await.unwrap();
        assert!(!scheduler.fail_task(t1, "boom").await.unwrap());

        // The dependent stays blocked until the caller cancels it.
        let blocked: Vec<TaskId> = scheduler
            .blocked_tasks()
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(blocked, vec![t2]);

        scheduler.cancel_task(t2, Some("blocker failed".into())).await.unwrap();
        let task2 = scheduler.get_task(t2).await.unwrap().unwrap();
        assert_eq!(task2.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_events_emitted_in_order() {
        let scheduler = scheduler();
        let mut events = scheduler.subscribe();
        let agent = AgentId::new();
        scheduler.register_agent(agent, caps(&["code"]), 4).unwrap();

        let id = scheduler
            .submit(TaskRequest::new("t", "", "code"))
            .await
            .unwrap();
        scheduler.schedule_once().await.unwrap();
        scheduler.start_task(id).await.unwrap();
        scheduler
            .complete_task(id, serde_json::json!({}))
            .await
            .unwrap();

        assert!(matches!(
            events.try_recv().unwrap(),
            SchedulerEvent::AgentRegistered { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SchedulerEvent::TaskSubmitted { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SchedulerEvent::TaskAssigned { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SchedulerEvent::TaskStarted { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SchedulerEvent::TaskCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_archive_requires_terminal() {
        let scheduler = scheduler();
        let id = scheduler
            .submit(TaskRequest::new("t", "", "code"))
            .await
            .unwrap();
        assert!(scheduler.archive_task(id).await.is_err());

        scheduler.cancel_task(id, None).await.unwrap();
        scheduler.archive_task(id).await.unwrap();
        assert!(scheduler.get_task(id).await.unwrap().is_none());
    }
}
