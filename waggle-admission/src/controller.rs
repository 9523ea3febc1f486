//! Admission controller
//!
//! Folds the global, per-provider, and per-agent policies into a single
//! [`AdmissionController::admit`] decision, applying the configured
//! degradation mode when the global policy would deny.

use crate::error::{AdmissionError, AdmissionResult};
use crate::events::{AdmissionEvent, EventChannel};
use crate::policy::{AgentPolicy, DenyReason, GlobalPolicy, ProviderPolicy, ThrottleMode};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use waggle_config::{AdmissionSection, AgentLimits, DegradationMode, ProviderLimits};
use waggle_core::{AgentId, Priority};

/// One admission question: may this request proceed right now?
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    pub provider: String,
    pub agent: Option<AgentId>,
    pub estimated_tokens: u64,
    pub estimated_cost: f64,
    pub priority: Priority,
}

/// The controller's answer.
#[derive(Debug, Clone)]
pub struct AdmitDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub retry_after: Option<Duration>,
    /// Set when the request passed only through a degradation path; the
    /// caller should route it through the backpressure queue.
    pub degraded: bool,
}

impl AdmitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after: None,
            degraded: false,
        }
    }

    fn allow_degraded() -> Self {
        Self {
            degraded: true,
            ..Self::allow()
        }
    }

    fn deny(reason: DenyReason) -> Self {
        let retry_after = match &reason {
            DenyReason::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        };
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after,
            degraded: false,
        }
    }

    /// Convert a denial into the error callers propagate.
    pub fn into_error(self) -> Option<AdmissionError> {
        let reason = self.reason?;
        Some(match reason {
            DenyReason::RateLimit {
                dimension,
                retry_after,
            } => AdmissionError::RateLimited {
                dimension,
                retry_after,
            },
            DenyReason::BudgetExceeded { window } => AdmissionError::BudgetExceeded { window },
            DenyReason::Concurrency => AdmissionError::ConcurrencyExhausted,
            DenyReason::Throttled | DenyReason::Shed | DenyReason::PriorityFloor { .. } => {
                AdmissionError::RateLimited {
                    dimension: "global".to_string(),
                    retry_after: None,
                }
            }
        })
    }
}

/// Layered admission control over every provider, agent, and the system.
pub struct AdmissionController {
    providers: DashMap<String, Arc<ProviderPolicy>>,
    agents: DashMap<AgentId, Arc<AgentPolicy>>,
    global: GlobalPolicy,
    default_provider_limits: ProviderLimits,
    agent_limits: AgentLimits,
    degradation: DegradationMode,
    shed_probability: f64,
    events: EventChannel,
}

impl AdmissionController {
    pub fn new(section: &AdmissionSection) -> Self {
        let providers = DashMap::new();
        for (name, limits) in &section.providers {
            providers.insert(
                name.clone(),
                Arc::new(ProviderPolicy::from_limits(name.clone(), limits)),
            );
        }
        Self {
            providers,
            agents: DashMap::new(),
            global: GlobalPolicy::from_limits(&section.global),
            default_provider_limits: ProviderLimits::default(),
            agent_limits: section.agent.clone(),
            degradation: section.degradation_mode,
            shed_probability: section.global.shed_probability,
            events: EventChannel::default(),
        }
    }

    /// Observable admission events: denials, throttle and breaker changes.
    pub fn subscribe(&self) -> broadcast::Receiver<AdmissionEvent> {
        self.events.subscribe()
    }

    /// Share the controller's event channel, e.g. with the backpressure
    /// queue so breaker transitions land on the same stream.
    pub fn events(&self) -> EventChannel {
        self.events.clone()
    }

    /// Decide whether a request may proceed.
    pub fn admit(&self, request: &AdmitRequest) -> AdmitDecision {
        self.admit_at(request, Instant::now())
    }

    pub fn admit_at(&self, request: &AdmitRequest, now: Instant) -> AdmitDecision {
        let (mode, changed) = self.global.update_throttle();
        if let Some((from, to)) = changed {
            warn!(?from, ?to, "throttle mode changed");
            self.events
                .publish(AdmissionEvent::ThrottleModeChanged { from, to });
        }

        // Critical mode rejects unconditionally, before any accounting.
        if mode == ThrottleMode::Critical {
            return self.denied(request, DenyReason::Throttled);
        }

        if let Err(reason) = self
            .global
            .check_at(request.estimated_tokens, request.estimated_cost, now)
        {
            match self.degradation {
                DegradationMode::Reject => return self.denied(request, reason),
                DegradationMode::Queue => {
                    debug!(provider = %request.provider, "global denial degraded to queue");
                    return AdmitDecision::allow_degraded();
                }
                DegradationMode::Shed => {
                    if rand::random::<f64>() < self.shed_probability {
                        return self.denied(request, DenyReason::Shed);
                    }
                    return AdmitDecision::allow_degraded();
                }
                DegradationMode::Priority => {
                    let floor = mode.priority_floor();
                    if request.priority > floor {
                        return AdmitDecision::allow_degraded();
                    }
                    return self.denied(request, DenyReason::PriorityFloor { floor });
                }
            }
        }

        let provider = self.provider_policy(&request.provider);
        if let Err(reason) =
            provider.check_at(request.estimated_tokens, request.estimated_cost, now)
        {
            return self.denied(request, reason);
        }

        if let Some(agent_id) = request.agent {
            let agent = self.agent_policy(agent_id);
            if let Err(reason) = agent.check_task_at(now) {
                return self.denied(request, reason);
            }
        }

        AdmitDecision::allow()
    }

    /// Acquire one concurrent slot on the global and provider counters.
    /// Must be balanced with [`release_slots`](Self::release_slots).
    pub fn acquire_slots(&self, provider: &str) -> AdmissionResult<()> {
        if !self.global.try_acquire_slot() {
            return Err(AdmissionError::ConcurrencyExhausted);
        }
        let policy = self.provider_policy(provider);
        if !policy.try_acquire_slot() {
            self.global.release_slot();
            return Err(AdmissionError::ConcurrencyExhausted);
        }
        Ok(())
    }

    pub fn release_slots(&self, provider: &str) {
        self.provider_policy(provider).release_slot();
        self.global.release_slot();
    }

    /// Acquire a per-agent concurrent task slot; balanced like provider slots.
    pub fn acquire_agent_slot(&self, agent: AgentId) -> AdmissionResult<()> {
        if self.agent_policy(agent).try_acquire_slot() {
            Ok(())
        } else {
            Err(AdmissionError::ConcurrencyExhausted)
        }
    }

    pub fn release_agent_slot(&self, agent: AgentId) {
        self.agent_policy(agent).release_slot();
    }

    /// Charge a message send against an agent's message window.
    pub fn record_agent_message(&self, agent: AgentId) -> AdmissionResult<()> {
        self.agent_policy(agent)
            .record_message_at(Instant::now())
            .map_err(|_| AdmissionError::RateLimited {
                dimension: "messages_per_minute".to_string(),
                retry_after: None,
            })
    }

    /// Charge a memory operation against an agent's memory-op window.
    pub fn record_agent_memory_op(&self, agent: AgentId) -> AdmissionResult<()> {
        self.agent_policy(agent)
            .record_memory_op_at(Instant::now())
            .map_err(|_| AdmissionError::RateLimited {
                dimension: "memory_ops_per_minute".to_string(),
                retry_after: None,
            })
    }

    /// Mean utilization across the global policy's populated dimensions.
    pub fn system_load(&self) -> f64 {
        self.global.system_load()
    }

    pub fn throttle_mode(&self) -> ThrottleMode {
        self.global.throttle_mode()
    }

    fn denied(&self, request: &AdmitRequest, reason: DenyReason) -> AdmitDecision {
        debug!(provider = %request.provider, ?reason, "admission denied");
        self.events.publish(AdmissionEvent::Denied {
            provider: Some(request.provider.clone()),
            agent: request.agent.map(|a| a.to_string()),
            reason: reason.clone(),
        });
        AdmitDecision::deny(reason)
    }

    /// Providers not named in configuration get the default limits.
    fn provider_policy(&self, name: &str) -> Arc<ProviderPolicy> {
        self.providers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderPolicy::from_limits(
                    name.to_string(),
                    &self.default_provider_limits,
                ))
            })
            .clone()
    }

    fn agent_policy(&self, agent: AgentId) -> Arc<AgentPolicy> {
        self.agents
            .entry(agent)
            .or_insert_with(|| Arc::new(AgentPolicy::from_limits(&self.agent_limits)))
            .clone()
    }
}
