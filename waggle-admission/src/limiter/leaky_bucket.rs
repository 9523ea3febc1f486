//! Leaky bucket limiter

use super::Decision;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct LeakState {
    /// Admissions currently queued, drained lazily at the leak rate.
    level: f64,
    last_leak: Instant,
}

/// FIFO admission queue draining at a constant rate. An admission is
/// accepted only if the bucket has room and the newcomer's estimated
/// dequeue time stays within `max_wait`. Draining happens lazily on every
/// probe, so no background timer is required.
pub struct LeakyBucket {
    capacity: f64,
    leak_rate: f64,
    max_wait: Duration,
    state: Mutex<LeakState>,
}

impl LeakyBucket {
    /// Queue of `capacity` admissions leaking at `leak_rate` per second;
    /// admissions whose estimated dequeue exceeds `max_wait` are refused.
    pub fn new(capacity: u64, leak_rate: f64, max_wait: Duration) -> Self {
        Self {
            capacity: capacity as f64,
            leak_rate,
            max_wait,
            state: Mutex::new(LeakState {
                level: 0.0,
                last_leak: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self, cost: u64) -> Decision {
        self.try_acquire_at(cost, Instant::now())
    }

    pub fn try_acquire_at(&self, cost: u64, now: Instant) -> Decision {
        let cost = cost as f64;
        if cost > self.capacity {
            return Decision::deny();
        }

        let mut state = self.state.lock();
        self.leak(&mut state, now);

        if state.level + cost > self.capacity {
            // Wait until enough has drained for the cost to fit.
            let overflow = state.level + cost - self.capacity;
            return Decision::wait(Duration::from_secs_f64(overflow / self.leak_rate));
        }

        // The last unit of this admission drains after everything ahead of it.
        let est_dequeue = Duration::from_secs_f64((state.level + cost - 1.0).max(0.0) / self.leak_rate);
        if est_dequeue > self.max_wait {
            let excess = est_dequeue - self.max_wait;
            return Decision::wait(excess);
        }

        state.level += cost;
        Decision::allow()
    }

    /// Suspend until the admission fits, up to `max_wait`.
    pub async fn acquire(&self, cost: u64, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let decision = self.try_acquire(cost);
            if decision.allowed {
                return true;
            }
            let Some(wait) = decision.retry_after else {
                return false;
            };
            if Instant::now() + wait > deadline {
                return false;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Current queue depth.
    pub fn level(&self) -> f64 {
        self.level_at(Instant::now())
    }

    pub fn level_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.leak(&mut state, now);
        state.level
    }

    /// Fraction of queue capacity in use, in [0, 1].
    pub fn utilization(&self) -> f64 {
        self.level() / self.capacity
    }

    /// Empty the queue.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.level = 0.0;
        state.last_leak = Instant::now();
    }

    fn leak(&self, state: &mut LeakState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_leak);
        if elapsed > Duration::ZERO {
            state.level = (state.level - elapsed.as_secs_f64() * self.leak_rate).max(0.0);
            state.last_leak = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fills_then_overflows() {
        let bucket = LeakyBucket::new(3, 1.0, Duration::from_secs(10));
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(bucket.try_acquire_at(1, t0).allowed);
        }
        let denied = bucket.try_acquire_at(1, t0);
        assert!(!denied.allowed);
        // One admission must drain first.
        let wait = denied.retry_after.unwrap();
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));
    }

    #[test]
    fn test_drains_over_time() {
        let bucket = LeakyBucket::new(2, 10.0, Duration::from_secs(1));
        let t0 = Instant::now();

        assert!(bucket.try_acquire_at(2, t0).allowed);
        assert!(!bucket.try_acquire_at(1, t0).allowed);

        // 10/sec leak: after 150 ms, 1.5 units have drained.
        assert!(bucket
            .try_acquire_at(1, t0 + Duration::from_millis(150))
            .allowed);
    }

    #[test]
    fn test_max_wait_refuses_long_queues() {
        // Slow leak: second admission would wait ~1 s but only 100 ms allowed.
        let bucket = LeakyBucket::new(10, 1.0, Duration::from_millis(100));
        let t0 = Instant::now();

        assert!(bucket.try_acquire_at(1, t0).allowed);
        let denied = bucket.try_acquire_at(1, t0);
        assert!(!denied.allowed);
        assert!(denied.retry_after.is_some());
    }

    #[test]
    fn test_cost_above_capacity_is_permanent() {
        let bucket = LeakyBucket::new(2, 1.0, Duration::from_secs(1));
        let decision = bucket.try_acquire(3);
        assert!(!decision.allowed);
        assert!(decision.retry_after.is_none());
    }

    #[test]
    fn test_reset_empties() {
        let bucket = LeakyBucket::new(1, 0.001, Duration::from_secs(3600));
        let t0 = Instant::now();
        assert!(bucket.try_acquire_at(1, t0).allowed);
        assert!(!bucket.try_acquire_at(1, t0).allowed);
        bucket.reset();
        assert!(bucket.try_acquire(1).allowed);
    }
}
