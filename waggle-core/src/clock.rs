//! Monotonic time source
//!
//! Rate limiters, circuit breakers, and election timers all take an explicit
//! `Instant` through their `…_at` entry points so tests can drive time
//! deterministically; production callers go through [`Clock`].

use chrono::{DateTime, Utc};
use std::time::Instant;

/// Process-wide time source.
///
/// Monotonic readings come from [`Instant`] and never go backwards.
/// Wall-clock stamps (`created_at`, spend entries, heartbeats) use
/// [`Utc`] and are only ever recorded, never compared for ordering.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock;

impl Clock {
    /// Current monotonic instant.
    pub fn now() -> Instant {
        Instant::now()
    }

    /// Current wall-clock timestamp.
    pub fn timestamp() -> DateTime<Utc> {
        Utc::now()
    }

    /// Milliseconds since the Unix epoch.
    pub fn epoch_millis() -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = Clock::now();
        let b = Clock::now();
        assert!(b >= a);
    }

    #[test]
    fn test_epoch_millis_positive() {
        assert!(Clock::epoch_millis() > 0);
    }
}
