//! Spend tracking and token budgets
//!
//! Every completed request appends `(timestamp, provider, tokens, cost)` to
//! the spend log. Alongside it, each provider carries a 24-hour rolling
//! token budget: crossing the warning fraction logs once per window,
//! exceeding the limit marks the provider unhealthy until enough of the
//! window rolls over.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Spend log failure.
#[derive(Error, Debug)]
#[error("spend log error: {0}")]
pub struct SpendLogError(pub String);

/// One append-only spend record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendEntry {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub tokens: u64,
    pub cost: f64,
}

/// Append-only spend storage.
pub trait SpendLog: Send + Sync {
    fn append(&self, entry: SpendEntry) -> Result<(), SpendLogError>;
    fn entries(&self) -> Result<Vec<SpendEntry>, SpendLogError>;
    /// Total (tokens, cost) for one provider.
    fn provider_totals(&self, provider: &str) -> Result<(u64, f64), SpendLogError>;
    /// Total (tokens, cost) across providers.
    fn totals(&self) -> Result<(u64, f64), SpendLogError>;
}

/// In-memory spend log.
#[derive(Default)]
pub struct MemorySpendLog {
    entries: Mutex<Vec<SpendEntry>>,
}

impl MemorySpendLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpendLog for MemorySpendLog {
    fn append(&self, entry: SpendEntry) -> Result<(), SpendLogError> {
        self.entries.lock().push(entry);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<SpendEntry>, SpendLogError> {
        Ok(self.entries.lock().clone())
    }

    fn provider_totals(&self, provider: &str) -> Result<(u64, f64), SpendLogError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.provider == provider)
            .fold((0, 0.0), |(tokens, cost), e| {
                (tokens + e.tokens, cost + e.cost)
            }))
    }

    fn totals(&self) -> Result<(u64, f64), SpendLogError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .fold((0, 0.0), |(tokens, cost), e| {
                (tokens + e.tokens, cost + e.cost)
            }))
    }
}

/// Sled-backed append-only spend log.
pub struct SledSpendLog {
    tree: sled::Tree,
    next_index: Mutex<u64>,
}

impl SledSpendLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SpendLogError> {
        let db = sled::open(path).map_err(|e| SpendLogError(e.to_string()))?;
        let tree = db
            .open_tree("spend")
            .map_err(|e| SpendLogError(e.to_string()))?;
        let next_index = tree.len() as u64;
        Ok(Self {
            tree,
            next_index: Mutex::new(next_index),
        })
    }
}

impl SpendLog for SledSpendLog {
    fn append(&self, entry: SpendEntry) -> Result<(), SpendLogError> {
        let mut index = self.next_index.lock();
        let key = format!("{:020}", *index);
        let value = serde_json::to_vec(&entry).map_err(|e| SpendLogError(e.to_string()))?;
        self.tree
            .insert(key.as_bytes(), value)
            .map_err(|e| SpendLogError(e.to_string()))?;
        *index += 1;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<SpendEntry>, SpendLogError> {
        let mut entries = Vec::new();
        for result in self.tree.iter() {
            let (_, value) = result.map_err(|e| SpendLogError(e.to_string()))?;
            entries.push(serde_json::from_slice(&value).map_err(|e| SpendLogError(e.to_string()))?);
        }
        Ok(entries)
    }

    fn provider_totals(&self, provider: &str) -> Result<(u64, f64), SpendLogError> {
        Ok(self
            .entries()?
            .iter()
            .filter(|e| e.provider == provider)
            .fold((0, 0.0), |(tokens, cost), e| {
                (tokens + e.tokens, cost + e.cost)
            }))
    }

    fn totals(&self) -> Result<(u64, f64), SpendLogError> {
        Ok(self.entries()?.iter().fold((0, 0.0), |(tokens, cost), e| {
            (tokens + e.tokens, cost + e.cost)
        }))
    }
}

const BUDGET_WINDOW: Duration = Duration::from_secs(24 * 3600);

struct BudgetState {
    /// (instant, tokens) records inside the rolling window.
    records: VecDeque<(Instant, u64)>,
    used: u64,
    warned: bool,
}

/// 24-hour rolling token budget for one provider.
pub struct TokenBudget {
    provider: String,
    limit: u64,
    warn_fraction: f64,
    state: Mutex<BudgetState>,
}

impl TokenBudget {
    /// A zero limit disables enforcement.
    pub fn new(provider: impl Into<String>, limit: u64, warn_fraction: f64) -> Self {
        Self {
            provider: provider.into(),
            limit,
            warn_fraction,
            state: Mutex::new(BudgetState {
                records: VecDeque::new(),
                used: 0,
                warned: false,
            }),
        }
    }

    pub fn record(&self, tokens: u64) {
        self.record_at(tokens, Instant::now())
    }

    pub fn record_at(&self, tokens: u64, now: Instant) {
        if self.limit == 0 {
            return;
        }
        let mut state = self.state.lock();
        Self::roll(&mut state, now);
        state.records.push_back((now, tokens));
        state.used += tokens;

        let warn_at = (self.limit as f64 * self.warn_fraction) as u64;
        if !state.warned && warn_at > 0 && state.used >= warn_at {
            state.warned = true;
            warn!(
                provider = %self.provider,
                used = state.used,
                limit = self.limit,
                "token budget warning threshold crossed"
            );
        }
    }

    /// Whether the provider is over budget right now.
    pub fn exhausted(&self) -> bool {
        self.exhausted_at(Instant::now())
    }

    pub fn exhausted_at(&self, now: Instant) -> bool {
        if self.limit == 0 {
            return false;
        }
        let mut state = self.state.lock();
        Self::roll(&mut state, now);
        state.used >= self.limit
    }

    /// Whether `tokens` more would stay inside the budget.
    pub fn would_fit_at(&self, tokens: u64, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut state = self.state.lock();
        Self::roll(&mut state, now);
        state.used + tokens <= self.limit
    }

    pub fn used_at(&self, now: Instant) -> u64 {
        let mut state = self.state.lock();
        Self::roll(&mut state, now);
        state.used
    }

    fn roll(state: &mut BudgetState, now: Instant) {
        let mut rolled = false;
        while let Some(&(at, tokens)) = state.records.front() {
            if now.saturating_duration_since(at) >= BUDGET_WINDOW {
                state.used -= tokens;
                state.records.pop_front();
                rolled = true;
            } else {
                break;
            }
        }
        if rolled {
            state.warned = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(provider: &str, tokens: u64, cost: f64) -> SpendEntry {
        SpendEntry {
            timestamp: Utc::now(),
            provider: provider.to_string(),
            tokens,
            cost,
        }
    }

    #[test]
    fn test_memory_log_totals() {
        let log = MemorySpendLog::new();
        log.append(entry("p1", 100, 0.01)).unwrap();
        log.append(entry("p2", 50, 0.02)).unwrap();
        log.append(entry("p1", 25, 0.005)).unwrap();

        assert_eq!(log.provider_totals("p1").unwrap(), (125, 0.015));
        let (tokens, cost) = log.totals().unwrap();
        assert_eq!(tokens, 175);
        assert!((cost - 0.035).abs() < 1e-9);
    }

    #[test]
    fn test_sled_log_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = SledSpendLog::open(dir.path()).unwrap();
        log.append(entry("p1", 1, 0.0)).unwrap();
        log.append(entry("p2", 2, 0.0)).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].provider, "p1");
        assert_eq!(entries[1].provider, "p2");
    }

    #[test]
    fn test_budget_exhaustion_and_rollover() {
        let budget = TokenBudget::new("p", 100, 0.8);
        let t0 = Instant::now();

        budget.record_at(99, t0);
        assert!(!budget.exhausted_at(t0));
        assert!(!budget.would_fit_at(500, t0));
        assert!(budget.would_fit_at(1, t0));

        budget.record_at(1, t0);
        assert!(budget.exhausted_at(t0));

        // A day later the window has rolled over.
        let tomorrow = t0 + BUDGET_WINDOW;
        assert!(!budget.exhausted_at(tomorrow));
        assert_eq!(budget.used_at(tomorrow), 0);
    }

    #[test]
    fn test_zero_limit_never_exhausts() {
        let budget = TokenBudget::new("p", 0, 0.8);
        budget.record(1_000_000);
        assert!(!budget.exhausted());
    }
}
