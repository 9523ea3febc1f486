//! Admission policies
//!
//! A policy folds several limiter dimensions into one decision. Checks run
//! in two phases under a per-policy gate: probe every dimension, then
//! commit, so a late-failing dimension never leaves an early one charged.
//! Admissions within one policy are thereby serializable.

use crate::limiter::{Decision, SlidingWindow, TokenBucket};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use waggle_config::{AgentLimits, GlobalLimits, ProviderLimits};
use waggle_core::Priority;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Cost windows count micro-USD so limiter arithmetic stays integral.
fn usd_to_micro(usd: f64) -> u64 {
    (usd * 1e6).round().max(0.0) as u64
}

/// First failing dimension of a denied admission.
#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    RateLimit {
        dimension: String,
        retry_after: Option<Duration>,
    },
    BudgetExceeded {
        window: String,
    },
    Concurrency,
    /// Critical throttle mode rejects unconditionally.
    Throttled,
    /// Shed-mode degradation dropped the request.
    Shed,
    /// Priority-mode degradation: the caller was below the floor.
    PriorityFloor {
        floor: Priority,
    },
}

/// Counted concurrent slots. Acquire and release must be balanced by the
/// caller; nothing is released automatically on timeout.
#[derive(Debug)]
pub struct SlotCounter {
    max: u64,
    used: AtomicU64,
}

impl SlotCounter {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            used: AtomicU64::new(0),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self) {
        let previous = self.used.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "slot release without matching acquire");
    }

    pub fn available(&self) -> bool {
        self.used.load(Ordering::Acquire) < self.max
    }

    pub fn in_use(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.in_use() as f64 / self.max as f64
    }
}

fn deny_from(dimension: &str, decision: Decision) -> DenyReason {
    DenyReason::RateLimit {
        dimension: dimension.to_string(),
        retry_after: decision.retry_after,
    }
}

/// Rate, token, concurrency, and cost caps for one LLM provider.
pub struct ProviderPolicy {
    name: String,
    rpm: Option<SlidingWindow>,
    tpm: Option<TokenBucket>,
    slots: Option<SlotCounter>,
    cost_minute: Option<SlidingWindow>,
    cost_hour: Option<SlidingWindow>,
    cost_day: Option<SlidingWindow>,
    gate: Mutex<()>,
}

impl ProviderPolicy {
    pub fn from_limits(name: impl Into<String>, limits: &ProviderLimits) -> Self {
        let rpm_max = if limits.burst {
            limits.rpm + limits.rpm / 2
        } else {
            limits.rpm
        };
        Self {
            name: name.into(),
            rpm: (limits.rpm > 0).then(|| SlidingWindow::new(rpm_max, MINUTE, 60)),
            // Seeded with a full minute of tokens, refilling at tpm/60 per second.
            tpm: (limits.tpm > 0).then(|| TokenBucket::new(limits.tpm, limits.tpm as f64 / 60.0)),
            slots: (limits.concurrent > 0).then(|| SlotCounter::new(limits.concurrent)),
            cost_minute: (limits.cost_per_minute > 0.0)
                .then(|| SlidingWindow::new(usd_to_micro(limits.cost_per_minute), MINUTE, 60)),
            cost_hour: (limits.cost_per_hour > 0.0)
                .then(|| SlidingWindow::new(usd_to_micro(limits.cost_per_hour), HOUR, 60)),
            cost_day: (limits.cost_per_day > 0.0)
                .then(|| SlidingWindow::new(usd_to_micro(limits.cost_per_day), DAY, 96)),
            gate: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Probe-then-commit admission of one request.
    pub fn check_at(
        &self,
        estimated_tokens: u64,
        estimated_cost: f64,
        now: Instant,
    ) -> Result<(), DenyReason> {
        let _gate = self.gate.lock();
        let cost_micro = usd_to_micro(estimated_cost);

        if let Some(rpm) = &self.rpm {
            let d = rpm.probe_at(1, now);
            if !d.allowed {
                return Err(deny_from("rpm", d));
            }
        }
        if let Some(tpm) = &self.tpm {
            let d = tpm.probe_at(estimated_tokens, now);
            if !d.allowed {
                return Err(deny_from("tpm", d));
            }
        }
        if let Some(slots) = &self.slots {
            if !slots.available() {
                return Err(DenyReason::Concurrency);
            }
        }
        for (window, label) in [
            (&self.cost_minute, "minute"),
            (&self.cost_hour, "hour"),
            (&self.cost_day, "day"),
        ] {
            if let Some(w) = window {
                if !w.probe_at(cost_micro, now).allowed {
                    return Err(DenyReason::BudgetExceeded {
                        window: label.to_string(),
                    });
                }
            }
        }

        // Commit.
        if let Some(rpm) = &self.rpm {
            rpm.try_acquire_at(1, now);
        }
        if let Some(tpm) = &self.tpm {
            tpm.try_acquire_at(estimated_tokens, now);
        }
        for window in [&self.cost_minute, &self.cost_hour, &self.cost_day]
            .into_iter()
            .flatten()
        {
            window.try_acquire_at(cost_micro, now);
        }
        Ok(())
    }

    pub fn try_acquire_slot(&self) -> bool {
        self.slots.as_ref().map_or(true, SlotCounter::try_acquire)
    }

    pub fn release_slot(&self) {
        if let Some(slots) = &self.slots {
            slots.release();
        }
    }
}

/// Per-agent execution caps.
pub struct AgentPolicy {
    tasks: Option<SlidingWindow>,
    memory_ops: Option<SlidingWindow>,
    messages: Option<SlidingWindow>,
    slots: Option<SlotCounter>,
    memory_quota_bytes: u64,
    cpu_quota: f64,
}

impl AgentPolicy {
    pub fn from_limits(limits: &AgentLimits) -> Self {
        Self {
            tasks: (limits.tasks_per_minute > 0)
                .then(|| SlidingWindow::new(limits.tasks_per_minute, MINUTE, 60)),
            memory_ops: (limits.memory_ops_per_minute > 0)
                .then(|| SlidingWindow::new(limits.memory_ops_per_minute, MINUTE, 60)),
            messages: (limits.messages_per_minute > 0)
                .then(|| SlidingWindow::new(limits.messages_per_minute, MINUTE, 60)),
            slots: (limits.max_concurrent_tasks > 0)
                .then(|| SlotCounter::new(limits.max_concurrent_tasks)),
            memory_quota_bytes: limits.memory_quota_bytes,
            cpu_quota: limits.cpu_quota,
        }
    }

    /// Admit one task start for this agent.
    pub fn check_task_at(&self, now: Instant) -> Result<(), DenyReason> {
        if let Some(slots) = &self.slots {
            if !slots.available() {
                return Err(DenyReason::Concurrency);
            }
        }
        if let Some(tasks) = &self.tasks {
            let d = tasks.try_acquire_at(1, now);
            if !d.allowed {
                return Err(deny_from("tasks_per_minute", d));
            }
        }
        Ok(())
    }

    pub fn record_memory_op_at(&self, now: Instant) -> Result<(), DenyReason> {
        if let Some(ops) = &self.memory_ops {
            let d = ops.try_acquire_at(1, now);
            if !d.allowed {
                return Err(deny_from("memory_ops_per_minute", d));
            }
        }
        Ok(())
    }

    pub fn record_message_at(&self, now: Instant) -> Result<(), DenyReason> {
        if let Some(messages) = &self.messages {
            let d = messages.try_acquire_at(1, now);
            if !d.allowed {
                return Err(deny_from("messages_per_minute", d));
            }
        }
        Ok(())
    }

    pub fn try_acquire_slot(&self) -> bool {
        self.slots.as_ref().map_or(true, SlotCounter::try_acquire)
    }

    pub fn release_slot(&self) {
        if let Some(slots) = &self.slots {
            slots.release();
        }
    }

    pub fn within_memory_quota(&self, bytes: u64) -> bool {
        self.memory_quota_bytes == 0 || bytes <= self.memory_quota_bytes
    }

    pub fn within_cpu_quota(&self, share: f64) -> bool {
        self.cpu_quota <= 0.0 || share <= self.cpu_quota
    }
}

/// Load-driven throttle escalation for the global policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleMode {
    Normal,
    Emergency,
    Critical,
}

impl ThrottleMode {
    /// Floor a request must strictly exceed under priority-mode
    /// degradation. Nothing exceeds `Critical`, so critical mode admits
    /// no degraded traffic at all.
    pub fn priority_floor(self) -> Priority {
        match self {
            ThrottleMode::Normal => Priority::Normal,
            ThrottleMode::Emergency => Priority::High,
            ThrottleMode::Critical => Priority::Critical,
        }
    }
}

/// System-wide caps plus the derived load and throttle mode.
pub struct GlobalPolicy {
    rpm: Option<SlidingWindow>,
    tpm: Option<TokenBucket>,
    slots: Option<SlotCounter>,
    cost_hour: Option<SlidingWindow>,
    cost_day: Option<SlidingWindow>,
    threshold: f64,
    mode: Mutex<ThrottleMode>,
    gate: Mutex<()>,
}

impl GlobalPolicy {
    pub fn from_limits(limits: &GlobalLimits) -> Self {
        Self {
            rpm: (limits.rpm > 0).then(|| SlidingWindow::new(limits.rpm, MINUTE, 60)),
            tpm: (limits.tpm > 0).then(|| TokenBucket::new(limits.tpm, limits.tpm as f64 / 60.0)),
            slots: (limits.concurrent > 0).then(|| SlotCounter::new(limits.concurrent)),
            cost_hour: (limits.cost_per_hour > 0.0)
                .then(|| SlidingWindow::new(usd_to_micro(limits.cost_per_hour), HOUR, 60)),
            cost_day: (limits.cost_per_day > 0.0)
                .then(|| SlidingWindow::new(usd_to_micro(limits.cost_per_day), DAY, 96)),
            threshold: limits.throttle_threshold,
            mode: Mutex::new(ThrottleMode::Normal),
            gate: Mutex::new(()),
        }
    }

    /// Probe-then-commit admission against the global caps.
    pub fn check_at(
        &self,
        estimated_tokens: u64,
        estimated_cost: f64,
        now: Instant,
    ) -> Result<(), DenyReason> {
        let _gate = self.gate.lock();
        let cost_micro = usd_to_micro(estimated_cost);

        if let Some(rpm) = &self.rpm {
            let d = rpm.probe_at(1, now);
            if !d.allowed {
                return Err(deny_from("global_rpm", d));
            }
        }
        if let Some(tpm) = &self.tpm {
            let d = tpm.probe_at(estimated_tokens, now);
            if !d.allowed {
                return Err(deny_from("global_tpm", d));
            }
        }
        if let Some(slots) = &self.slots {
            if !slots.available() {
                return Err(DenyReason::Concurrency);
            }
        }
        for (window, label) in [(&self.cost_hour, "hour"), (&self.cost_day, "day")] {
            if let Some(w) = window {
                if !w.probe_at(cost_micro, now).allowed {
                    return Err(DenyReason::BudgetExceeded {
                        window: label.to_string(),
                    });
                }
            }
        }

        if let Some(rpm) = &self.rpm {
            rpm.try_acquire_at(1, now);
        }
        if let Some(tpm) = &self.tpm {
            tpm.try_acquire_at(estimated_tokens, now);
        }
        for window in [&self.cost_hour, &self.cost_day].into_iter().flatten() {
            window.try_acquire_at(cost_micro, now);
        }
        Ok(())
    }

    /// Mean utilization across the populated dimensions, in [0, 1].
    pub fn system_load(&self) -> f64 {
        let mut sum = 0.0;
        let mut populated = 0;
        if let Some(rpm) = &self.rpm {
            sum += rpm.utilization();
            populated += 1;
        }
        if let Some(tpm) = &self.tpm {
            sum += tpm.utilization();
            populated += 1;
        }
        if let Some(slots) = &self.slots {
            sum += slots.utilization();
            populated += 1;
        }
        if let Some(w) = &self.cost_hour {
            sum += w.utilization();
            populated += 1;
        }
        if let Some(w) = &self.cost_day {
            sum += w.utilization();
            populated += 1;
        }
        if populated == 0 {
            0.0
        } else {
            sum / populated as f64
        }
    }

    /// Recompute the throttle mode from current load. Escalates at
    /// `threshold` and `1.1·threshold`; de-escalates only below
    /// `0.8·threshold`. Returns `(mode, Some((from, to)))` on a change.
    pub fn update_throttle(&self) -> (ThrottleMode, Option<(ThrottleMode, ThrottleMode)>) {
        let load = self.system_load();
        let mut mode = self.mode.lock();
        let current = *mode;

        let next = if load >= 1.1 * self.threshold {
            ThrottleMode::Critical
        } else if load >= self.threshold {
            // Escalate, never relax, inside the upper band.
            if current == ThrottleMode::Critical {
                ThrottleMode::Critical
            } else {
                ThrottleMode::Emergency
            }
        } else if load < 0.8 * self.threshold {
            ThrottleMode::Normal
        } else {
            current
        };

        *mode = next;
        if next != current {
            (next, Some((current, next)))
        } else {
            (next, None)
        }
    }

    pub fn throttle_mode(&self) -> ThrottleMode {
        *self.mode.lock()
    }

    pub fn try_acquire_slot(&self) -> bool {
        self.slots.as_ref().map_or(true, SlotCounter::try_acquire)
    }

    pub fn release_slot(&self) {
        if let Some(slots) = &self.slots {
            slots.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waggle_config::GlobalLimits;

    fn limits(rpm: u64, tpm: u64, concurrent: u64) -> ProviderLimits {
        ProviderLimits {
            rpm,
            tpm,
            concurrent,
            burst: false,
            cost_per_minute: 0.0,
            cost_per_hour: 0.0,
            cost_per_day: 0.0,
        }
    }

    #[test]
    fn test_provider_first_failing_dimension() {
        let policy = ProviderPolicy::from_limits("p", &limits(2, 1_000, 0));
        let now = Instant::now();

        assert!(policy.check_at(10, 0.0, now).is_ok());
        assert!(policy.check_at(10, 0.0, now).is_ok());
        match policy.check_at(10, 0.0, now) {
            Err(DenyReason::RateLimit { dimension, .. }) => assert_eq!(dimension, "rpm"),
            other => panic!("expected rpm denial, got {:?}", other),
        }
    }

    #[test]
    fn test_denied_check_charges_nothing() {
        // tpm will deny; rpm must not be charged by the failed attempt.
        let policy = ProviderPolicy::from_limits("p", &limits(10, 100, 0));
        let now = Instant::now();

        assert!(policy.check_at(100, 0.0, now).is_ok());
        assert!(policy.check_at(1, 0.0, now).is_err()); // tpm exhausted

        // rpm saw exactly one committed request, so nine more fit the window.
        for _ in 0..9 {
            assert!(policy.check_at(0, 0.0, now).is_ok());
        }
        assert!(policy.check_at(0, 0.0, now).is_err());
    }

    #[test]
    fn test_cost_window_denies() {
        let mut l = limits(0, 0, 0);
        l.cost_per_day = 1.0;
        let policy = ProviderPolicy::from_limits("p", &l);
        let now = Instant::now();

        assert!(policy.check_at(0, 0.6, now).is_ok());
        match policy.check_at(0, 0.6, now) {
            Err(DenyReason::BudgetExceeded { window }) => assert_eq!(window, "day"),
            other => panic!("expected budget denial, got {:?}", other),
        }
    }

    #[test]
    fn test_slot_counter_balanced() {
        let slots = SlotCounter::new(2);
        assert!(slots.try_acquire());
        assert!(slots.try_acquire());
        assert!(!slots.try_acquire());
        slots.release();
        assert!(slots.try_acquire());
        assert_eq!(slots.in_use(), 2);
    }

    #[test]
    fn test_burst_raises_rpm_ceiling() {
        let mut l = limits(10, 0, 0);
        l.burst = true;
        let policy = ProviderPolicy::from_limits("p", &l);
        let now = Instant::now();
        for _ in 0..15 {
            assert!(policy.check_at(0, 0.0, now).is_ok());
        }
        assert!(policy.check_at(0, 0.0, now).is_err());
    }

    #[test]
    fn test_throttle_escalation_and_hysteresis() {
        let global = GlobalPolicy::from_limits(&GlobalLimits {
            rpm: 0,
            tpm: 0,
            concurrent: 10,
            cost_per_hour: 0.0,
            cost_per_day: 0.0,
            throttle_threshold: 0.5,
            shed_probability: 0.0,
        });

        assert_eq!(global.throttle_mode(), ThrottleMode::Normal);

        // Load 0.5 (5/10 slots) crosses the threshold.
        for _ in 0..5 {
            assert!(global.try_acquire_slot());
        }
        let (mode, changed) = global.update_throttle();
        assert_eq!(mode, ThrottleMode::Emergency);
        assert!(changed.is_some());

        // 0.6 >= 1.1 * 0.5 escalates to critical.
        assert!(global.try_acquire_slot());
        let (mode, _) = global.update_throttle();
        assert_eq!(mode, ThrottleMode::Critical);

        // Dropping into the hysteresis band keeps critical.
        global.release_slot();
        global.release_slot();
        let (mode, _) = global.update_throttle();
        assert_eq!(mode, ThrottleMode::Critical);

        // Below 0.8 * threshold = 0.4 the mode relaxes.
        for _ in 0..2 {
            global.release_slot();
        }
        let (mode, changed) = global.update_throttle();
        assert_eq!(mode, ThrottleMode::Normal);
        assert!(changed.is_some());
    }

    #[test]
    fn test_agent_policy_task_rate() {
        let policy = AgentPolicy::from_limits(&AgentLimits {
            tasks_per_minute: 2,
            memory_ops_per_minute: 0,
            messages_per_minute: 0,
            max_concurrent_tasks: 0,
            memory_quota_bytes: 0,
            cpu_quota: 0.0,
        });
        let now = Instant::now();

        assert!(policy.check_task_at(now).is_ok());
        assert!(policy.check_task_at(now).is_ok());
        assert!(policy.check_task_at(now).is_err());
    }

    #[test]
    fn test_agent_quotas() {
        let policy = AgentPolicy::from_limits(&AgentLimits {
            tasks_per_minute: 0,
            memory_ops_per_minute: 1,
            messages_per_minute: 1,
            max_concurrent_tasks: 0,
            memory_quota_bytes: 1_024,
            cpu_quota: 0.5,
        });
        let now = Instant::now();

        assert!(policy.within_memory_quota(512));
        assert!(!policy.within_memory_quota(2_048));
        assert!(policy.within_cpu_quota(0.25));
        assert!(!policy.within_cpu_quota(0.75));

        assert!(policy.record_memory_op_at(now).is_ok());
        assert!(policy.record_memory_op_at(now).is_err());
        assert!(policy.record_message_at(now).is_ok());
        assert!(policy.record_message_at(now).is_err());
    }
}
