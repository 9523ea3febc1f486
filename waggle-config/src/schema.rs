//! Configuration schema types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Root configuration for a Waggle deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WaggleConfig {
    pub swarm: SwarmSection,
    pub admission: AdmissionSection,
    pub queue: QueueSection,
    pub router: RouterSection,
    pub task: TaskSection,
}

/// Physical layout of queen/worker links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    #[default]
    Hierarchical,
    Mesh,
    HierarchicalMesh,
    Adaptive,
}

/// Swarm loop timing and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSection {
    pub topology: Topology,
    /// Upper bound on registered workers.
    pub max_workers: usize,
    /// Byzantine tolerance f; requires n >= 3f+1 participants.
    pub fault_tolerance: usize,
    pub heartbeat_interval_ms: u64,
    pub worker_timeout_ms: u64,
    pub election_timeout_ms: u64,
    pub consensus_timeout_ms: u64,
}

impl Default for SwarmSection {
    fn default() -> Self {
        Self {
            topology: Topology::Hierarchical,
            max_workers: 16,
            fault_tolerance: 1,
            heartbeat_interval_ms: 1_000,
            worker_timeout_ms: 10_000,
            election_timeout_ms: 3_000,
            consensus_timeout_ms: 5_000,
        }
    }
}

/// Per-provider admission caps. A zero disables that dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderLimits {
    /// Requests per minute.
    pub rpm: u64,
    /// Tokens per minute.
    pub tpm: u64,
    /// Concurrent in-flight requests.
    pub concurrent: u64,
    /// Allow bursts up to 150% of rpm within the window.
    pub burst: bool,
    /// USD caps per window.
    pub cost_per_minute: f64,
    pub cost_per_hour: f64,
    pub cost_per_day: f64,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            rpm: 60,
            tpm: 100_000,
            concurrent: 8,
            burst: false,
            cost_per_minute: 0.0,
            cost_per_hour: 0.0,
            cost_per_day: 0.0,
        }
    }
}

/// Per-agent admission caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    pub tasks_per_minute: u64,
    pub memory_ops_per_minute: u64,
    pub messages_per_minute: u64,
    pub max_concurrent_tasks: u64,
    /// Bytes of working memory an agent may hold.
    pub memory_quota_bytes: u64,
    /// Fraction of one CPU an agent may consume.
    pub cpu_quota: f64,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            tasks_per_minute: 30,
            memory_ops_per_minute: 300,
            messages_per_minute: 120,
            max_concurrent_tasks: 4,
            memory_quota_bytes: 512 * 1024 * 1024,
            cpu_quota: 1.0,
        }
    }
}

/// System-wide admission caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalLimits {
    pub rpm: u64,
    pub tpm: u64,
    pub concurrent: u64,
    pub cost_per_hour: f64,
    pub cost_per_day: f64,
    /// System load above which throttling escalates.
    pub throttle_threshold: f64,
    /// Drop probability under shed-mode degradation.
    pub shed_probability: f64,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            rpm: 600,
            tpm: 1_000_000,
            concurrent: 64,
            cost_per_hour: 0.0,
            cost_per_day: 0.0,
            throttle_threshold: 0.9,
            shed_probability: 0.5,
        }
    }
}

/// Strategy when the global policy would deny a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationMode {
    /// Fail fast.
    #[default]
    Reject,
    /// Admit flagged as degraded; the caller forwards to the backpressure queue.
    Queue,
    /// Random drop with the configured probability.
    Shed,
    /// Admit only callers above a dynamic priority floor.
    Priority,
}

/// Admission control configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionSection {
    /// Caps keyed by provider name.
    pub providers: BTreeMap<String, ProviderLimits>,
    pub agent: AgentLimits,
    pub global: GlobalLimits,
    pub degradation_mode: DegradationMode,
}

/// Retry profile for queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
        }
    }
}

/// Circuit breaker profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
        }
    }
}

/// Backpressure queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_size: usize,
    pub default_timeout_ms: u64,
    /// Worker pool draining the queue.
    pub workers: usize,
    pub retry: RetrySection,
    pub circuit_breaker: BreakerSection,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            default_timeout_ms: 60_000,
            workers: 4,
            retry: RetrySection::default(),
            circuit_breaker: BreakerSection::default(),
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 300_000,
            max_entries: 1_024,
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub cache: CacheSection,
    /// Models tried in order when the resolved model fails.
    pub fallback_chain: Vec<String>,
    /// Generic model name -> provider-qualified name.
    pub routes: BTreeMap<String, String>,
    /// 24h token budget per provider; zero disables.
    pub daily_token_budget: BTreeMap<String, u64>,
    /// Fraction of the budget at which a warning fires.
    pub budget_warn_fraction: f64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            cache: CacheSection::default(),
            fallback_chain: Vec::new(),
            routes: BTreeMap::new(),
            daily_token_budget: BTreeMap::new(),
            budget_warn_fraction: 0.8,
        }
    }
}

/// Task execution defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    pub default_max_retries: u32,
    pub default_timeout_ms: u64,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_timeout_ms: 300_000,
        }
    }
}
