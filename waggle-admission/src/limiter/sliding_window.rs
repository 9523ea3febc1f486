//! Sliding window limiter

use super::Decision;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct WindowState {
    /// (bucket index, count), oldest first. Indices are monotone.
    buckets: VecDeque<(u64, u64)>,
    total: u64,
}

/// Counts acquisitions over a rolling window subdivided into sub-buckets.
/// With a single sub-bucket this degenerates to a fixed window resetting on
/// the window boundary.
pub struct SlidingWindow {
    max: u64,
    bucket_width: Duration,
    bucket_count: u64,
    origin: Instant,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    /// At most `max` units per `window`, tracked in `buckets` sub-buckets.
    pub fn new(max: u64, window: Duration, buckets: u32) -> Self {
        let buckets = buckets.max(1) as u64;
        Self {
            max,
            bucket_width: window / buckets as u32,
            bucket_count: buckets,
            origin: Instant::now(),
            state: Mutex::new(WindowState {
                buckets: VecDeque::new(),
                total: 0,
            }),
        }
    }

    /// Fixed-window mode: one bucket spanning the whole window.
    pub fn fixed(max: u64, window: Duration) -> Self {
        Self::new(max, window, 1)
    }

    pub fn try_acquire(&self, cost: u64) -> Decision {
        self.try_acquire_at(cost, Instant::now())
    }

    pub fn try_acquire_at(&self, cost: u64, now: Instant) -> Decision {
        if cost > self.max {
            return Decision::deny();
        }

        let idx = self.bucket_index(now);
        let mut state = self.state.lock();
        self.roll(&mut state, idx);

        if state.total + cost <= self.max {
            state.total += cost;
            match state.buckets.back_mut() {
                Some((i, count)) if *i == idx => *count += cost,
                _ => state.buckets.push_back((idx, cost)),
            }
            Decision::allow()
        } else {
            Decision::wait(self.wait_for_room(&state, cost, now))
        }
    }

    /// Like [`try_acquire_at`](Self::try_acquire_at) but without counting,
    /// for compound checks that commit only when every dimension passes.
    pub fn probe_at(&self, cost: u64, now: Instant) -> Decision {
        if cost > self.max {
            return Decision::deny();
        }

        let idx = self.bucket_index(now);
        let mut state = self.state.lock();
        self.roll(&mut state, idx);

        if state.total + cost <= self.max {
            Decision::allow()
        } else {
            Decision::wait(self.wait_for_room(&state, cost, now))
        }
    }

    /// Suspend until `cost` units fit in the window, up to `max_wait`.
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

    /// Units currently counted in the window.
    pub fn current(&self) -> u64 {
        self.current_at(Instant::now())
    }

    pub fn current_at(&self, now: Instant) -> u64 {
        let idx = self.bucket_index(now);
        let mut state = self.state.lock();
        self.roll(&mut state, idx);
        state.total
    }

    /// Fraction of the window consumed, in [0, 1].
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.current() as f64 / self.max as f64
    }

    /// Discard all counted history.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.buckets.clear();
        state.total = 0;
    }

    fn bucket_index(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.origin).as_nanos()
            / self.bucket_width.as_nanos().max(1)) as u64
    }

    fn roll(&self, state: &mut WindowState, idx: u64) {
        while let Some(&(front_idx, count)) = state.buckets.front() {
            if front_idx + self.bucket_count <= idx {
                state.total -= count;
                state.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until enough of the oldest buckets expire to fit `cost`.
    fn wait_for_room(&self, state: &WindowState, cost: u64, now: Instant) -> Duration {
        let mut freed = 0;
        for &(idx, count) in &state.buckets {
            freed += count;
            if state.total - freed + cost <= self.max {
                let expires_at = self.origin
                    + Duration::from_nanos(
                        (self.bucket_width.as_nanos() as u64)
                            .saturating_mul(idx + self.bucket_count),
                    );
                return expires_at.saturating_duration_since(now);
            }
        }
        // Unreachable while cost <= max, but stay defensive about rounding.
        self.bucket_width * self.bucket_count as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_cap() {
        let window = SlidingWindow::new(5, Duration::from_millis(100), 10);
        let t0 = Instant::now();

        for _ in 0..5 {
            assert!(window.try_acquire_at(1, t0).allowed);
        }
        let denied = window.try_acquire_at(1, t0);
        assert!(!denied.allowed);
        assert!(denied.retry_after.is_some());

        // After the window has fully passed the count is clear again.
        let later = t0 + Duration::from_millis(110);
        for _ in 0..5 {
            assert!(window.try_acquire_at(1, later).allowed);
        }
    }

    #[test]
    fn test_partial_expiry_frees_room() {
        let window = SlidingWindow::new(2, Duration::from_millis(100), 10);
        let t0 = Instant::now();

        assert!(window.try_acquire_at(1, t0).allowed);
        assert!(window
            .try_acquire_at(1, t0 + Duration::from_millis(50))
            .allowed);

        // At +60ms both are still inside the window.
        assert!(!window
            .try_acquire_at(1, t0 + Duration::from_millis(60))
            .allowed);

        // At +105ms the first acquisition has rolled out.
        assert!(window
            .try_acquire_at(1, t0 + Duration::from_millis(105))
            .allowed);
    }

    #[test]
    fn test_fixed_window_resets_on_boundary() {
        let window = SlidingWindow::fixed(3, Duration::from_millis(100));
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(window.try_acquire_at(1, t0).allowed);
        }
        assert!(!window.try_acquire_at(1, t0 + Duration::from_millis(99)).allowed);
        assert!(window.try_acquire_at(1, t0 + Duration::from_millis(101)).allowed);
    }

    #[test]
    fn test_cost_above_max_is_permanent() {
        let window = SlidingWindow::new(5, Duration::from_millis(100), 10);
        let decision = window.try_acquire(6);
        assert!(!decision.allowed);
        assert!(decision.retry_after.is_none());
    }

    #[test]
    fn test_wait_estimate_points_at_expiry() {
        let window = SlidingWindow::new(1, Duration::from_millis(100), 10);
        let t0 = Instant::now();
        assert!(window.try_acquire_at(1, t0).allowed);

        let denied = window.try_acquire_at(1, t0 + Duration::from_millis(20));
        let wait = denied.retry_after.unwrap();
        // The only bucket expires 100 ms after t0.
        assert!(wait <= Duration::from_millis(80));
        assert!(wait >= Duration::from_millis(70));
    }
}
