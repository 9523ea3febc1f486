//! Backpressure queue
//!
//! A four-level priority queue of async jobs drained by a tokio worker
//! pool. Items are FIFO within a level and strictly ordered across levels.
//! Each item carries its own deadline and retry profile; the circuit
//! breaker is consulted when an item reaches the head, not at enqueue.

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::error::{AdmissionError, AdmissionResult};
use crate::events::{AdmissionEvent, EventChannel};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;
use waggle_config::QueueSection;
use waggle_core::Priority;

/// A queued unit of work. Jobs are re-invoked on retry, so they are `Fn`.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
pub type Job = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Per-item execution profile.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub priority: Priority,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl JobOptions {
    pub fn from_section(section: &QueueSection) -> Self {
        Self {
            priority: Priority::Normal,
            timeout: Duration::from_millis(section.default_timeout_ms),
            max_retries: section.retry.max_retries,
            initial_backoff: Duration::from_millis(section.retry.initial_backoff_ms),
            backoff_multiplier: section.retry.backoff_multiplier,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Terminal result of a queued job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// The item's deadline passed before it could finish.
    TimedOut,
    /// The circuit breaker was open when the item reached the head.
    CircuitOpen,
    /// Retries exhausted; carries the last error.
    Exhausted(String),
    /// The queue shut down before the item ran.
    Cancelled,
}

/// Handle for observing one enqueued job.
pub struct JobHandle {
    pub id: Uuid,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    /// Wait for the job's terminal outcome.
    pub async fn outcome(self) -> JobOutcome {
        self.rx.await.unwrap_or(JobOutcome::Cancelled)
    }
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub queued: u64,
    pub processed: u64,
    pub retried: u64,
    pub rejected: u64,
    pub depth: usize,
    pub depth_per_priority: [usize; 4],
    pub circuit_state: CircuitState,
}

struct QueuedJob {
    id: Uuid,
    job: Job,
    priority: Priority,
    deadline: Instant,
    attempt: u32,
    max_retries: u32,
    initial_backoff: Duration,
    backoff_multiplier: f64,
    outcome_tx: oneshot::Sender<JobOutcome>,
}

struct QueueInner {
    levels: Mutex<[VecDeque<QueuedJob>; 4]>,
    depth: AtomicUsize,
    max_size: usize,
    notify: Notify,
    closed: AtomicBool,
    breaker: CircuitBreaker,
    queued: AtomicU64,
    processed: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    events: EventChannel,
}

/// The backpressure queue. Clone-cheap; clones share the same queue.
#[derive(Clone)]
pub struct BackpressureQueue {
    inner: Arc<QueueInner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackpressureQueue {
    pub fn new(section: &QueueSection) -> Self {
        Self::with_events(section, EventChannel::default())
    }

    /// Share an event channel with the admission controller so breaker
    /// transitions land on the same stream as denials.
    pub fn with_events(section: &QueueSection, events: EventChannel) -> Self {
        let breaker = CircuitBreaker::new(
            section.circuit_breaker.failure_threshold,
            section.circuit_breaker.success_threshold,
            Duration::from_millis(section.circuit_breaker.open_timeout_ms),
        );
        Self {
            inner: Arc::new(QueueInner {
                levels: Mutex::new(Default::default()),
                depth: AtomicUsize::new(0),
                max_size: section.max_size,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                breaker,
                queued: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                events,
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the draining worker pool.
    pub fn start(&self, workers: usize) {
        let mut pool = self.workers.lock();
        for _ in 0..workers.max(1) {
            let inner = self.inner.clone();
            pool.push(tokio::spawn(async move {
                QueueInner::worker_loop(inner).await;
            }));
        }
    }

    /// Enqueue a job. Fails immediately when the queue is full or closed.
    pub fn enqueue(&self, job: Job, options: JobOptions) -> AdmissionResult<JobHandle> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::Cancelled);
        }
        if self.inner.depth.load(Ordering::Acquire) >= self.inner.max_size {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(AdmissionError::QueueFull);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let item = QueuedJob {
            id,
            job,
            priority: options.priority,
            deadline: Instant::now() + options.timeout,
            attempt: 1,
            max_retries: options.max_retries,
            initial_backoff: options.initial_backoff,
            backoff_multiplier: options.backoff_multiplier,
            outcome_tx: tx,
        };
        self.inner.push(item);
        self.inner.queued.fetch_add(1, Ordering::Relaxed);
        Ok(JobHandle { id, rx })
    }

    /// Stop the workers and cancel everything still queued.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let drained: Vec<QueuedJob> = {
            let mut levels = self.inner.levels.lock();
            levels.iter_mut().flat_map(|level| level.drain(..)).collect()
        };
        for item in drained {
            self.inner.depth.fetch_sub(1, Ordering::AcqRel);
            let _ = item.outcome_tx.send(JobOutcome::Cancelled);
        }
    }

    pub fn stats(&self) -> QueueStats {
        let levels = self.inner.levels.lock();
        let mut depth_per_priority = [0; 4];
        for (i, level) in levels.iter().enumerate() {
            depth_per_priority[i] = level.len();
        }
        QueueStats {
            queued: self.inner.queued.load(Ordering::Relaxed),
            processed: self.inner.processed.load(Ordering::Relaxed),
            retried: self.inner.retried.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            depth: self.inner.depth.load(Ordering::Acquire),
            depth_per_priority,
            circuit_state: self.inner.breaker.state(),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdmissionEvent> {
        self.inner.events.subscribe()
    }
}

impl QueueInner {
    fn push(&self, item: QueuedJob) {
        {
            let mut levels = self.levels.lock();
            levels[item.priority.index()].push_back(item);
        }
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueuedJob> {
        let mut levels = self.levels.lock();
        for priority in Priority::SCHEDULING_ORDER {
            if let Some(item) = levels[priority.index()].pop_front() {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                return Some(item);
            }
        }
        None
    }

    async fn worker_loop(inner: Arc<QueueInner>) {
        loop {
            let item = loop {
                // Stop promptly on shutdown; whatever stays queued is
                // cancelled by the drain, not processed.
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                if let Some(item) = inner.pop() {
                    break item;
                }
                inner.notify.notified().await;
            };
            inner.process(item).await;
        }
    }

    async fn process(self: &Arc<Self>, mut item: QueuedJob) {
        let now = Instant::now();
        if now >= item.deadline {
            debug!(job = %item.id, "job deadline passed in queue");
            self.rejected.fetch_add(1, Ordering::Relaxed);
            let _ = item.outcome_tx.send(JobOutcome::TimedOut);
            return;
        }

        if self.guarded(|b| b.try_acquire()).is_err() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            let _ = item.outcome_tx.send(JobOutcome::CircuitOpen);
            return;
        }

        let budget = item.deadline.saturating_duration_since(now);
        match tokio::time::timeout(budget, (item.job)()).await {
            Ok(Ok(())) => {
                self.guarded(|b| b.record_success());
                self.processed.fetch_add(1, Ordering::Relaxed);
                let _ = item.outcome_tx.send(JobOutcome::Completed);
            }
            Ok(Err(error)) => {
                self.guarded(|b| b.record_failure());
                if item.attempt > item.max_retries {
                    warn!(job = %item.id, attempt = item.attempt, "job retries exhausted");
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    let _ = item.outcome_tx.send(JobOutcome::Exhausted(error));
                    return;
                }
                self.retried.fetch_add(1, Ordering::Relaxed);
                let backoff = Self::backoff_with_jitter(&item);
                item.attempt += 1;
                debug!(job = %item.id, attempt = item.attempt, ?backoff, "job retry scheduled");

                let inner = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    if inner.closed.load(Ordering::Acquire) {
                        let _ = item.outcome_tx.send(JobOutcome::Cancelled);
                        return;
                    }
                    // Retries re-enter at the original priority.
                    inner.push(item);
                });
            }
            Err(_elapsed) => {
                self.guarded(|b| b.record_failure());
                self.rejected.fetch_add(1, Ordering::Relaxed);
                let _ = item.outcome_tx.send(JobOutcome::TimedOut);
            }
        }
    }

    /// `initial · multiplier^(attempt-1)` with full jitter.
    fn backoff_with_jitter(item: &QueuedJob) -> Duration {
        let exponent = (item.attempt - 1) as i32;
        let base = item.initial_backoff.as_secs_f64() * item.backoff_multiplier.powi(exponent);
        let jittered = rand::thread_rng().gen_range(0.0..=1.0) * base;
        Duration::from_secs_f64(jittered)
    }

    /// Run a breaker operation, publishing any state transition.
    fn guarded<R>(&self, op: impl FnOnce(&CircuitBreaker) -> R) -> R {
        let before = self.breaker.state();
        let result = op(&self.breaker);
        let after = self.breaker.state();
        if before != after {
            self.events.publish(AdmissionEvent::BreakerStateChanged {
                from: before,
                to: after,
            });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waggle_config::{BreakerSection, RetrySection};

    fn section() -> QueueSection {
        QueueSection {
            max_size: 16,
            default_timeout_ms: 5_000,
            workers: 2,
            retry: RetrySection {
                max_retries: 3,
                initial_backoff_ms: 1,
                backoff_multiplier: 2.0,
            },
            circuit_breaker: BreakerSection {
                failure_threshold: 2,
                success_threshold: 1,
                open_timeout_ms: 60_000,
            },
        }
    }

    fn ok_job() -> Job {
        Arc::new(|| Box::pin(async { Ok(()) }))
    }

    fn failing_job() -> Job {
        Arc::new(|| Box::pin(async { Err("boom".to_string()) }))
    }

    #[tokio::test]
    async fn test_job_completes() {
        let queue = BackpressureQueue::new(&section());
        queue.start(1);

        let handle = queue
            .enqueue(ok_job(), JobOptions::from_section(&section()))
            .unwrap();
        assert_eq!(handle.outcome().await, JobOutcome::Completed);
        assert_eq!(queue.stats().processed, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let queue = BackpressureQueue::new(&section());
        queue.start(1);

        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = calls.clone();
        let job: Job = Arc::new(move || {
            let calls = calls_clone.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(())
                }
            })
        });

        let handle = queue
            .enqueue(job, JobOptions::from_section(&section()))
            .unwrap();
        assert_eq!(handle.outcome().await, JobOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = queue.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.processed, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mut section = section();
        section.retry.max_retries = 1;
        // Two failures at threshold 2 would open the breaker and turn the
        // retry into a circuit rejection; keep it out of the way here.
        section.circuit_breaker.failure_threshold = 100;
        let queue = BackpressureQueue::new(&section);
        queue.start(1);

        let handle = queue
            .enqueue(failing_job(), JobOptions::from_section(&section))
            .unwrap();
        assert_eq!(
            handle.outcome().await,
            JobOutcome::Exhausted("boom".to_string())
        );
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_circuit_opens_and_rejects() {
        let mut section = section();
        section.retry.max_retries = 0;
        let queue = BackpressureQueue::new(&section);
        queue.start(1);
        let mut events = queue.subscribe();

        // Two consecutive failures open the circuit.
        for _ in 0..2 {
            let handle = queue
                .enqueue(failing_job(), JobOptions::from_section(&section))
                .unwrap();
            assert!(matches!(handle.outcome().await, JobOutcome::Exhausted(_)));
        }
        assert_eq!(queue.circuit_state(), CircuitState::Open);

        let handle = queue
            .enqueue(ok_job(), JobOptions::from_section(&section))
            .unwrap();
        assert_eq!(handle.outcome().await, JobOutcome::CircuitOpen);

        match events.recv().await {
            Ok(AdmissionEvent::BreakerStateChanged { to, .. }) => {
                assert_eq!(to, CircuitState::Open);
            }
            other => panic!("expected breaker event, got {:?}", other),
        }
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_full() {
        let mut section = section();
        section.max_size = 1;
        let queue = BackpressureQueue::new(&section);
        // No workers: the first item stays queued.

        let _held = queue
            .enqueue(ok_job(), JobOptions::from_section(&section))
            .unwrap();
        let overflow = queue.enqueue(ok_job(), JobOptions::from_section(&section));
        assert!(matches!(overflow, Err(AdmissionError::QueueFull)));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_order_within_drain() {
        let section = section();
        let queue = BackpressureQueue::new(&section);
        // Enqueue before starting workers so ordering is observable.
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (priority, tag) in [
            (Priority::Low, "low"),
            (Priority::Critical, "critical"),
            (Priority::Normal, "normal-a"),
            (Priority::Normal, "normal-b"),
        ] {
            let order = order.clone();
            let job: Job = Arc::new(move || {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().push(tag);
                    Ok(())
                })
            });
            handles.push(
                queue
                    .enqueue(
                        job,
                        JobOptions::from_section(&section).with_priority(priority),
                    )
                    .unwrap(),
            );
        }

        queue.start(1);
        for handle in handles {
            assert_eq!(handle.outcome().await, JobOutcome::Completed);
        }

        let drained = order.lock().clone();
        assert_eq!(drained, vec!["critical", "normal-a", "normal-b", "low"]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_item_times_out() {
        let section = section();
        let queue = BackpressureQueue::new(&section);

        let mut options = JobOptions::from_section(&section);
        options.timeout = Duration::ZERO;
        let handle = queue.enqueue(ok_job(), options).unwrap();

        queue.start(1);
        assert_eq!(handle.outcome().await, JobOutcome::TimedOut);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let section = section();
        let queue = BackpressureQueue::new(&section);
        let handle = queue
            .enqueue(ok_job(), JobOptions::from_section(&section))
            .unwrap();
        queue.shutdown().await;
        assert_eq!(handle.outcome().await, JobOutcome::Cancelled);
    }
}
