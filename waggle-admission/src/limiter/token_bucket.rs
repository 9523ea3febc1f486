//! Token bucket limiter

use super::Decision;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with lazy refill. Starts full, never overshoots capacity,
/// and is monotonic in time: idling only ever adds tokens.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `capacity` tokens, refilled at `refill_rate` tokens per second.
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to consume `cost` tokens at the current instant.
    pub fn try_acquire(&self, cost: u64) -> Decision {
        self.try_acquire_at(cost, Instant::now())
    }

    /// Try to consume `cost` tokens at an explicit instant.
    pub fn try_acquire_at(&self, cost: u64, now: Instant) -> Decision {
        let cost = cost as f64;
        if cost > self.capacity {
            return Decision::deny();
        }

        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= cost {
            state.tokens -= cost;
            Decision::allow()
        } else {
            let deficit = cost - state.tokens;
            Decision::wait(Duration::from_secs_f64(deficit / self.refill_rate))
        }
    }

    /// Like [`try_acquire_at`](Self::try_acquire_at) but without consuming,
    /// for compound checks that commit only when every dimension passes.
    pub fn probe_at(&self, cost: u64, now: Instant) -> Decision {
        let cost = cost as f64;
        if cost > self.capacity {
            return Decision::deny();
        }

        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= cost {
            Decision::allow()
        } else {
            let deficit = cost - state.tokens;
            Decision::wait(Duration::from_secs_f64(deficit / self.refill_rate))
        }
    }

    /// Suspend until `cost` tokens are available, up to `max_wait`.
    pub async fn acquire(&self, cost: u64, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let decision = self.try_acquire(cost);
            if decision.allowed {
                return true;
            }
            let Some(wait) = decision.retry_after else {
                return false; // cost exceeds capacity, waiting cannot help
            };
            if Instant::now() + wait > deadline {
                return false;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        self.available_at(Instant::now())
    }

    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// Fraction of capacity currently consumed, in [0, 1].
    pub fn utilization(&self) -> f64 {
        1.0 - self.available() / self.capacity
    }

    /// Restore to the initial full state.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.tokens = self.capacity;
        state.last_refill = Instant::now();
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed > Duration::ZERO {
            state.tokens =
                (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
            state.last_refill = now;
        }
    }
}
