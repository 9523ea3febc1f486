//! Admission control for the Waggle runtime
//!
//! Three layers, composed bottom-up:
//!
//! 1. [`limiter`] — token bucket, sliding window, and leaky bucket
//!    primitives with atomic `try_acquire` and suspending `acquire`.
//! 2. [`policy`] + [`controller`] — per-provider, per-agent, and global
//!    policies folded into a single admit decision with configurable
//!    degradation under global pressure.
//! 3. [`queue`] + [`breaker`] — a four-level backpressure queue with
//!    per-item timeout, jittered exponential retry, and a circuit breaker
//!    gating dequeue.

pub mod breaker;
pub mod controller;
pub mod error;
pub mod events;
pub mod limiter;
pub mod policy;
pub mod queue;

pub use breaker::{CircuitBreaker, CircuitState};
pub use controller::{AdmissionController, AdmitDecision, AdmitRequest};
pub use error::{AdmissionError, AdmissionResult};
pub use events::{AdmissionEvent, EventChannel};
pub use limiter::{Decision, LeakyBucket, SlidingWindow, TokenBucket};
pub use policy::{DenyReason, ThrottleMode};
pub use queue::{BackpressureQueue, Job, JobHandle, JobOptions, JobOutcome, QueueStats};
