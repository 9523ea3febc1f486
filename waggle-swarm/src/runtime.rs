//! Runtime composition root
//!
//! Wires configuration into the full stack: admission control and the
//! backpressure queue, the provider router, the task core with its
//! scheduler, and the queen with her worker bus and decision driver. The
//! external APIs — task submission, worker registration, completions,
//! collective decisions — all live here.

use crate::bus::{MessageBus, WorkerMessage};
use crate::decisions::DecisionDriver;
use crate::error::{SwarmError, SwarmResult};
use crate::queen::Queen;
use crate::recall::{ExecutionRecall, LinearScanIndex};
use crate::types::{DirectiveType, SwarmHealthSnapshot, WorkerSignals};
use crate::worker::WorkerHandle;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use waggle_admission::{
    AdmissionController, BackpressureQueue, Job, JobOptions, JobOutcome, QueueStats,
};
use waggle_config::{validate_config, WaggleConfig};
use waggle_consensus::{
    ByzantineParams, ConsensusKind, DecisionOutcome, MemoryConsensusLog,
};
use waggle_core::{AgentId, DirectiveId, ProposalId, TaskId};
use waggle_router::{
    MemorySpendLog, ProviderAdapter, ProviderRequest, ProviderResponse, ProviderRouter,
    ResponseStream, RouterStats, Transport,
};
use waggle_task::{
    AgentRegistry, AgentStatus, InMemoryTaskRepository, Scheduler, SchedulerConfig,
    SchedulerEvent, Task, TaskRequest,
};

/// Point-in-time runtime counters.
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    pub workers: usize,
    pub tasks_queued: usize,
    pub backpressure: QueueStats,
    pub router: RouterStats,
    pub system_load: f64,
}

/// The assembled orchestration runtime.
pub struct SwarmRuntime {
    config: WaggleConfig,
    admission: Arc<AdmissionController>,
    backpressure: BackpressureQueue,
    router: Arc<ProviderRouter>,
    registry: Arc<AgentRegistry>,
    scheduler: Arc<Scheduler>,
    bus: Arc<MessageBus>,
    queen: Arc<Queen>,
    decisions: Arc<DecisionDriver>,
    recall: Arc<ExecutionRecall>,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SwarmRuntime {
    pub fn new(config: WaggleConfig) -> SwarmResult<Self> {
        validate_config(&config)?;

        let admission = Arc::new(AdmissionController::new(&config.admission));
        let backpressure = BackpressureQueue::with_events(&config.queue, admission.events());
        let spend = Arc::new(MemorySpendLog::new());
        let router = Arc::new(ProviderRouter::new(
            &config.router,
            admission.clone(),
            spend,
        ));

        let registry = Arc::new(AgentRegistry::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(InMemoryTaskRepository::new()),
            registry.clone(),
            SchedulerConfig {
                default_max_retries: config.task.default_max_retries,
                queue_capacity: config.queue.max_size,
                ..SchedulerConfig::default()
            },
        ));

        let bus = Arc::new(MessageBus::new());
        let queen = Arc::new(Queen::new(
            "queen-0",
            Vec::new(),
            Duration::from_millis(config.swarm.election_timeout_ms),
            Duration::from_millis(config.swarm.heartbeat_interval_ms),
            registry.clone(),
            bus.clone(),
        ));

        let params = ByzantineParams::with_tolerance(
            3 * config.swarm.fault_tolerance + 1,
            config.swarm.fault_tolerance,
        )?;
        let decisions = Arc::new(DecisionDriver::new(
            Arc::new(MemoryConsensusLog::new()),
            bus.clone(),
            params,
        ));
        let recall = Arc::new(ExecutionRecall::new(Arc::new(LinearScanIndex::new())));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            admission,
            backpressure,
            router,
            registry,
            scheduler,
            bus,
            queen,
            decisions,
            recall,
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the background loops: queue workers, scheduling, directive
    /// dispatch, and the heartbeat sweep. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        // The single-queen deployment elects itself immediately.
        self.queen.tick_leadership();
        self.backpressure.start(self.config.queue.workers);

        let mut handles = self.loops.lock();

        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            scheduler.run(shutdown).await;
        }));

        // Subscribe before any assignment can happen so no event is missed.
        let assignments = self.scheduler.subscribe();
        handles.push(tokio::spawn(Self::dispatch_loop(
            self.scheduler.clone(),
            self.queen.clone(),
            assignments,
            self.config.task.default_timeout_ms,
            self.shutdown_tx.subscribe(),
        )));

        handles.push(tokio::spawn(Self::heartbeat_loop(
            self.scheduler.clone(),
            self.queen.clone(),
            self.decisions.clone(),
            Duration::from_millis(self.config.swarm.heartbeat_interval_ms),
            Duration::from_millis(self.config.swarm.worker_timeout_ms),
            self.shutdown_tx.subscribe(),
        )));

        info!(
            topology = ?self.config.swarm.topology,
            max_workers = self.config.swarm.max_workers,
            "swarm runtime started"
        );
    }

    /// Stop the loops, cancel queued work, and tell workers to stand down.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.loops.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        self.backpressure.shutdown().await;

        let workers: BTreeSet<AgentId> =
            self.registry.all().into_iter().map(|info| info.id).collect();
        self.bus.broadcast(&workers, WorkerMessage::Shutdown).await;
        info!("swarm runtime stopped");
    }

    // ---- task submission API ----

    /// Accept a task for execution; it enters the dependency graph and the
    /// ready queue immediately.
    pub async fn submit_task(&self, request: TaskRequest) -> SwarmResult<TaskId> {
        Ok(self.scheduler.submit(request).await?)
    }

    pub async fn get_task(&self, id: TaskId) -> SwarmResult<Option<Task>> {
        Ok(self.scheduler.get_task(id).await?)
    }

    pub async fn cancel_task(&self, id: TaskId, reason: Option<String>) -> SwarmResult<()> {
        Ok(self.scheduler.cancel_task(id, reason).await?)
    }

    /// A worker reports that it has begun executing its assigned task.
    pub async fn begin_task(&self, task: TaskId) -> SwarmResult<()> {
        Ok(self.scheduler.start_task(task).await?)
    }

    /// A worker reports a task result. Results from workers already marked
    /// offline are dropped without touching task state.
    #[instrument(skip(self, result))]
    pub async fn finish_task(
        &self,
        worker: AgentId,
        task: TaskId,
        result: Result<serde_json::Value, String>,
    ) -> SwarmResult<()> {
        if matches!(
            self.registry.get(worker).map(|info| info.status),
            Some(AgentStatus::Offline) | None
        ) {
            warn!(worker = %worker, task = %task, "late result from offline worker ignored");
            return Ok(());
        }
        match result {
            Ok(output) => self.scheduler.complete_task(task, output).await?,
            Err(error) => {
                self.scheduler.fail_task(task, &error).await?;
            }
        }
        // The result supersedes the in-flight directive either way: a
        // retry gets a fresh directive on its next assignment.
        self.queen.settle_task_directives(task);
        Ok(())
    }

    /// Remember a completed execution for semantic recall.
    pub async fn record_execution(&self, task: TaskId, embedding: Vec<f32>) -> SwarmResult<()> {
        let task = self
            .scheduler
            .get_task(task)
            .await?
            .ok_or(SwarmError::Task(waggle_task::TaskError::NotFound(task)))?;
        self.recall.record(&task, embedding);
        Ok(())
    }

    pub fn recall(&self) -> Arc<ExecutionRecall> {
        self.recall.clone()
    }

    // ---- worker API ----

    /// Register a worker with its capability tags, returning the mailbox
    /// the queen will deliver directives into.
    pub fn register_worker(&self, capabilities: BTreeSet<String>) -> SwarmResult<WorkerHandle> {
        if self.registry.len() >= self.config.swarm.max_workers {
            return Err(SwarmError::WorkerLimitReached(self.config.swarm.max_workers));
        }
        let id = AgentId::new();
        let max_concurrent = self.config.admission.agent.max_concurrent_tasks.max(1) as u32;
        self.scheduler
            .register_agent(id, capabilities, max_concurrent)?;
        let mailbox = self.bus.register(id);
        info!(worker = %id, "worker registered");
        Ok(WorkerHandle::new(id, mailbox))
    }

    pub fn heartbeat(&self, worker: AgentId, signals: WorkerSignals) -> SwarmResult<()> {
        Ok(self.scheduler.heartbeat(worker, signals.health_score())?)
    }

    pub fn unregister_worker(&self, worker: AgentId) -> SwarmResult<()> {
        self.scheduler.unregister_agent(worker)?;
        self.bus.unregister(worker);
        Ok(())
    }

    /// A worker's answer to a non-task directive. Counts against the
    /// worker's per-minute message quota.
    pub fn report_directive(
        &self,
        directive: DirectiveId,
        worker: AgentId,
        payload: serde_json::Value,
    ) -> SwarmResult<()> {
        self.admission.record_agent_message(worker)?;
        self.queen.record_response(directive, worker, payload)?;
        Ok(())
    }

    // ---- provider API ----

    /// Register an LLM provider's adapter and transport.
    pub fn register_provider(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        transport: Arc<dyn Transport>,
    ) {
        self.router.register_provider(adapter, transport);
    }

    pub async fn complete(&self, request: &ProviderRequest) -> SwarmResult<ProviderResponse> {
        Ok(self.router.complete(request).await?)
    }

    pub async fn stream_complete(&self, request: &ProviderRequest) -> SwarmResult<ResponseStream> {
        Ok(self.router.stream_complete(request).await?)
    }

    /// Completion with backpressure: a retryable failure re-runs through
    /// the queue's retry schedule and circuit breaker instead of surfacing
    /// immediately. Auth and invalid-request errors still surface at once.
    pub async fn complete_queued(
        &self,
        request: &ProviderRequest,
        priority: waggle_core::Priority,
    ) -> SwarmResult<ProviderResponse> {
        let first_error = match self.router.complete(request).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e.into()),
        };
        warn!(error = %first_error, "completion queued for retry");

        let slot: Arc<Mutex<Option<ProviderResponse>>> = Arc::new(Mutex::new(None));
        let router = self.router.clone();
        let request = request.clone();
        let slot_for_job = slot.clone();
        let job: Job = Arc::new(move || {
            let router = router.clone();
            let request = request.clone();
            let slot = slot_for_job.clone();
            Box::pin(async move {
                match router.complete(&request).await {
                    Ok(response) => {
                        *slot.lock() = Some(response);
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                }
            })
        });

        let options = JobOptions::from_section(&self.config.queue).with_priority(priority);
        let timeout = options.timeout;
        let handle = self.backpressure.enqueue(job, options)?;
        match handle.outcome().await {
            JobOutcome::Completed => slot.lock().take().ok_or_else(|| {
                SwarmError::Internal("completed retry produced no response".into())
            }),
            JobOutcome::CircuitOpen => {
                Err(waggle_admission::AdmissionError::CircuitOpen.into())
            }
            JobOutcome::TimedOut => {
                Err(waggle_admission::AdmissionError::QueueTimeout(timeout).into())
            }
            JobOutcome::Exhausted(message) => Err(SwarmError::Internal(format!(
                "completion retries exhausted: {}",
                message
            ))),
            JobOutcome::Cancelled => Err(waggle_admission::AdmissionError::Cancelled.into()),
        }
    }

    // ---- collective decisions ----

    /// Open a collective decision among every non-offline worker,
    /// soliciting ballots over the bus. Byzantine decisions run the PBFT
    /// three-phase protocol; the decision aborts after the configured
    /// consensus timeout.
    pub async fn open_decision(
        &self,
        kind: ConsensusKind,
        value: serde_json::Value,
    ) -> SwarmResult<ProposalId> {
        let eligible: BTreeSet<AgentId> = self
            .registry
            .all()
            .into_iter()
            .filter(|info| info.status != AgentStatus::Offline)
            .map(|info| info.id)
            .collect();
        let timeout = Duration::from_millis(self.config.swarm.consensus_timeout_ms);
        self.decisions
            .open(
                kind,
                value,
                eligible,
                BTreeMap::new(),
                Instant::now() + timeout,
                self.queen.term(),
            )
            .await
    }

    pub fn cast_vote(
        &self,
        decision: ProposalId,
        voter: AgentId,
        choice: impl Into<String>,
    ) -> SwarmResult<Option<DecisionOutcome>> {
        self.decisions.cast_vote(decision, voter, choice)
    }

    pub fn decision_outcome(&self, decision: ProposalId) -> SwarmResult<Option<DecisionOutcome>> {
        self.decisions.outcome(decision)
    }

    // ---- observation ----

    pub fn queen(&self) -> Arc<Queen> {
        self.queen.clone()
    }

    pub fn admission(&self) -> Arc<AdmissionController> {
        self.admission.clone()
    }

    pub fn backpressure(&self) -> BackpressureQueue {
        self.backpressure.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Aggregate worker health. A worker counts as healthy above a 0.6
    /// score while not offline; quorum uses the Byzantine parameters of
    /// the current population.
    pub fn health(&self) -> SwarmHealthSnapshot {
        let workers = self.registry.all();
        let total = workers.len();
        let healthy = workers
            .iter()
            .filter(|info| info.status != AgentStatus::Offline && info.health_score >= 0.6)
            .count();
        let overall = if total == 0 {
            0.0
        } else {
            healthy as f64 / total as f64
        };
        let has_quorum = total > 0 && ByzantineParams::new(total).has_quorum(healthy);
        SwarmHealthSnapshot {
            total_workers: total,
            healthy_workers: healthy,
            overall_health: overall,
            has_quorum,
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            workers: self.registry.len(),
            tasks_queued: self.scheduler.queue_depth(),
            backpressure: self.backpressure.stats(),
            router: self.router.stats(),
            system_load: self.admission.system_load(),
        }
    }

    // ---- background loops ----

    /// Forward scheduler assignments to workers as task directives.
    async fn dispatch_loop(
        scheduler: Arc<Scheduler>,
        queen: Arc<Queen>,
        mut events: tokio::sync::broadcast::Receiver<SchedulerEvent>,
        default_timeout_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return,
                event = events.recv() => event,
            };
            let assigned = match event {
                Ok(SchedulerEvent::TaskAssigned { task, agent }) => (task, agent),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dispatch loop lagged behind scheduler events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            let (task_id, agent) = assigned;
            let Ok(Some(task)) = scheduler.get_task(task_id).await else {
                continue;
            };
            let time_budget =
                Duration::from_millis(task.timeout_ms.unwrap_or(default_timeout_ms));
            let payload = serde_json::json!({
                "title": task.title,
                "type": task.task_type,
                "input": task.input,
            });
            if let Err(e) = queen
                .issue_directive(
                    DirectiveType::Task { task: task_id },
                    BTreeSet::from([agent]),
                    payload,
                    task.priority,
                    task.required_capabilities(),
                    time_budget,
                )
                .await
            {
                warn!(task = %task_id, error = %e, "directive dispatch failed");
            }
        }
    }

    /// Periodic sweep: leadership timer, silent workers, directive and
    /// decision deadlines.
    async fn heartbeat_loop(
        scheduler: Arc<Scheduler>,
        queen: Arc<Queen>,
        decisions: Arc<DecisionDriver>,
        interval: Duration,
        worker_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }

            queen.tick_leadership();

            for worker in scheduler.sweep_agents(worker_timeout) {
                let outcomes = queen.handle_worker_offline(worker).await;
                Self::apply_reassignments(&scheduler, &queen, outcomes).await;
            }

            for directive in queen.check_deadlines() {
                Self::fail_aborted_task(&scheduler, &queen, directive).await;
            }
            decisions.expire();
        }
    }

    /// Mirror directive reassignments into task state: hand the task to
    /// the replacement worker, or cancel it when none exists.
    async fn apply_reassignments(
        scheduler: &Scheduler,
        queen: &Queen,
        outcomes: Vec<(DirectiveId, Option<AgentId>)>,
    ) {
        for (directive, replacement) in outcomes {
            let Some(DirectiveType::Task { task }) =
                queen.directive(directive).map(|d| d.directive_type)
            else {
                continue;
            };
            let result = match replacement {
                Some(new_agent) => scheduler.reassign_task(task, new_agent).await,
                None => {
                    scheduler
                        .cancel_task(task, Some("no capable worker after timeout".into()))
                        .await
                }
            };
            if let Err(e) = result {
                warn!(task = %task, directive = %directive, error = %e, "reassignment bookkeeping failed");
            }
        }
    }

    /// A task directive hit its deadline: fail the task (retrying if it
    /// has budget) or cancel it when it never started.
    async fn fail_aborted_task(scheduler: &Scheduler, queen: &Queen, directive: DirectiveId) {
        let Some(DirectiveType::Task { task }) =
            queen.directive(directive).map(|d| d.directive_type)
        else {
            return;
        };
        let failed = scheduler.fail_task(task, "directive deadline exceeded").await;
        if failed.is_err() {
            // Never started on the worker: cancellation is the only legal exit.
            if let Err(e) = scheduler
                .cancel_task(task, Some("directive deadline exceeded".into()))
                .await
            {
                warn!(task = %task, error = %e, "deadline cleanup failed");
            }
        }
    }
}
