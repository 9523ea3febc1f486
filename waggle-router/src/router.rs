//! Request routing
//!
//! `complete` and `stream_complete` over the registered providers: resolve
//! the model, consult the cache, ask admission, dispatch through the
//! adapter, walk the fallback chain on retryable failures, and record
//! spend for whatever finally answered.

use crate::adapter::{ProviderAdapter, Transport};
use crate::cache::{CacheStats, ResponseCache};
use crate::error::{ProviderError, ProviderResult};
use crate::spend::{SpendEntry, SpendLog, TokenBudget};
use crate::stream::ResponseStream;
use crate::types::{ProviderRequest, ProviderResponse, StreamEvent, TokenUsage};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use waggle_admission::{AdmissionController, AdmitDecision, AdmitRequest};
use waggle_config::RouterSection;
use waggle_core::Priority;

struct ProviderHandle {
    adapter: Arc<dyn ProviderAdapter>,
    transport: Arc<dyn Transport>,
}

/// Router counters.
#[derive(Debug, Clone)]
pub struct RouterStats {
    pub completions: u64,
    pub failovers: u64,
    pub cache: CacheStats,
}

/// Releases concurrency slots when dropped, so a cancelled stream task
/// cannot leak them.
struct SlotGuard {
    admission: Arc<AdmissionController>,
    provider: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.admission.release_slots(&self.provider);
    }
}

/// Uniform completion router over heterogeneous providers.
pub struct ProviderRouter {
    handles: DashMap<String, ProviderHandle>,
    routes: BTreeMap<String, String>,
    fallback_chain: Vec<String>,
    cache: ResponseCache,
    admission: Arc<AdmissionController>,
    spend: Arc<dyn SpendLog>,
    budgets: DashMap<String, Arc<TokenBudget>>,
    daily_budgets: BTreeMap<String, u64>,
    warn_fraction: f64,
    completions: AtomicU64,
    failovers: AtomicU64,
}

impl ProviderRouter {
    pub fn new(
        section: &RouterSection,
        admission: Arc<AdmissionController>,
        spend: Arc<dyn SpendLog>,
    ) -> Self {
        Self {
            handles: DashMap::new(),
            routes: section.routes.clone(),
            fallback_chain: section.fallback_chain.clone(),
            cache: ResponseCache::new(&section.cache),
            admission,
            spend,
            budgets: DashMap::new(),
            daily_budgets: section.daily_token_budget.clone(),
            warn_fraction: section.budget_warn_fraction,
            completions: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
        }
    }

    /// Register a provider's adapter and transport under the adapter name.
    pub fn register_provider(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        transport: Arc<dyn Transport>,
    ) {
        self.handles
            .insert(adapter.name().to_string(), ProviderHandle { adapter, transport });
    }

    /// The rolling token budget for one provider.
    pub fn budget(&self, provider: &str) -> Arc<TokenBudget> {
        self.budgets
            .entry(provider.to_string())
            .or_insert_with(|| {
                let limit = self.daily_budgets.get(provider).copied().unwrap_or(0);
                Arc::new(TokenBudget::new(provider, limit, self.warn_fraction))
            })
            .clone()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            completions: self.completions.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }

    /// One-shot completion with cache, admission, and failover.
    #[instrument(skip(self, request))]
    pub async fn complete(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        let candidates = self.candidates(request)?;

        // Exact-match cache lookup against the primary resolution.
        let (primary_provider, primary_model) = &candidates[0];
        let cache_key =
            ResponseCache::key(&format!("{}/{}", primary_provider, primary_model), request);
        if let Some(hit) = self.cache.get(&cache_key) {
            debug!(model = %primary_model, "cache hit");
            return Ok(hit);
        }

        let mut last_error = ProviderError::ModelNotFound(
            request.model.clone().unwrap_or_else(|| "<unset>".into()),
        );

        for (provider, model) in &candidates {
            match self.try_candidate(provider, model, request).await {
                Ok(response) => {
                    self.completions.fetch_add(1, Ordering::Relaxed);
                    self.cache.put(cache_key, response.clone());
                    return Ok(response);
                }
                Err(error) => {
                    if !error.allows_failover() {
                        return Err(error);
                    }
                    warn!(provider = %provider, model = %model, error = %error, "candidate failed");
                    self.failovers.fetch_add(1, Ordering::Relaxed);
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    /// Streaming completion. Setup failures walk the fallback chain; once
    /// a stream is open, failures surface as an `Error` event.
    #[instrument(skip(self, request))]
    pub async fn stream_complete(&self, request: &ProviderRequest) -> ProviderResult<ResponseStream> {
        let candidates = self.candidates(request)?;
        let mut last_error = ProviderError::ModelNotFound(
            request.model.clone().unwrap_or_else(|| "<unset>".into()),
        );

        for (provider, model) in &candidates {
            match self.try_open_stream(provider, model, request).await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    if !error.allows_failover() {
                        return Err(error);
                    }
                    self.failovers.fetch_add(1, Ordering::Relaxed);
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    async fn try_candidate(
        &self,
        provider: &str,
        model: &str,
        request: &ProviderRequest,
    ) -> ProviderResult<ProviderResponse> {
        let handle = self
            .handles
            .get(provider)
            .ok_or_else(|| ProviderError::ModelNotFound(format!("{}/{}", provider, model)))?;
        let adapter = handle.adapter.clone();
        let transport = handle.transport.clone();
        drop(handle);

        self.check_budget_and_admission(provider, model, &adapter, request)?;

        self.admission.acquire_slots(provider)?;
        let result = self.dispatch(&*adapter, &*transport, model, request).await;
        self.admission.release_slots(provider);

        let response = result?;
        self.settle(provider, &response);
        Ok(response)
    }

    async fn dispatch(
        &self,
        adapter: &dyn ProviderAdapter,
        transport: &dyn Transport,
        model: &str,
        request: &ProviderRequest,
    ) -> ProviderResult<ProviderResponse> {
        let payload = adapter.build_request(request, model)?;
        let raw = transport
            .send(payload)
            .await
            .map_err(|e| adapter.classify_error(&e))?;
        let mut response = adapter.parse_response(raw)?;
        response.cost = adapter.pricing(model).cost(response.usage);
        Ok(response)
    }

    async fn try_open_stream(
        &self,
        provider: &str,
        model: &str,
        request: &ProviderRequest,
    ) -> ProviderResult<ResponseStream> {
        let handle = self
            .handles
            .get(provider)
            .ok_or_else(|| ProviderError::ModelNotFound(format!("{}/{}", provider, model)))?;
        let adapter = handle.adapter.clone();
        let transport = handle.transport.clone();
        drop(handle);

        self.check_budget_and_admission(provider, model, &adapter, request)?;

        self.admission.acquire_slots(provider)?;
        let guard = SlotGuard {
            admission: self.admission.clone(),
            provider: provider.to_string(),
        };

        let payload = match adapter.build_request(request, model) {
            Ok(payload) => payload,
            Err(e) => {
                drop(guard);
                return Err(e);
            }
        };
        let mut chunks = match transport.open_stream(payload).await {
            Ok(chunks) => chunks,
            Err(e) => {
                drop(guard);
                return Err(adapter.classify_error(&e));
            }
        };

        let (tx, rx) = mpsc::channel(32);
        let pricing = adapter.pricing(model);
        let spend = self.spend.clone();
        let budget = self.budget(provider);
        let provider_name = provider.to_string();

        let producer = tokio::spawn(async move {
            // Slots are held for the life of the stream; the guard releases
            // them on completion or abort.
            let _guard = guard;
            let mut streamed_chars = 0u64;

            while let Some(raw) = chunks.recv().await {
                match adapter.parse_stream_chunk(raw) {
                    Ok(Some(StreamEvent::Done { usage, .. })) => {
                        let cost = pricing.cost(usage);
                        let _ = spend.append(SpendEntry {
                            timestamp: chrono::Utc::now(),
                            provider: provider_name.clone(),
                            tokens: usage.total_tokens,
                            cost: cost.total,
                        });
                        budget.record(usage.total_tokens);
                        let _ = tx.send(StreamEvent::Done { usage, cost }).await;
                        return;
                    }
                    Ok(Some(event)) => {
                        if let StreamEvent::Content { delta } = &event {
                            streamed_chars += delta.len() as u64;
                        }
                        if tx.send(event).await.is_err() {
                            return; // consumer closed: cancellation
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                kind: error.kind().to_string(),
                                message: error.to_string(),
                                retryable: error.is_retryable(),
                            })
                            .await;
                        return;
                    }
                }
            }

            // Upstream ended without a terminal chunk: synthesize usage
            // from what was streamed.
            let usage = TokenUsage::new(0, streamed_chars / 4);
            let cost = pricing.cost(usage);
            let _ = spend.append(SpendEntry {
                timestamp: chrono::Utc::now(),
                provider: provider_name.clone(),
                tokens: usage.total_tokens,
                cost: cost.total,
            });
            budget.record(usage.total_tokens);
            let _ = tx.send(StreamEvent::Done { usage, cost }).await;
        });

        Ok(ResponseStream::new(rx, producer))
    }

    /// Budget gate, then the layered admission decision.
    fn check_budget_and_admission(
        &self,
        provider: &str,
        model: &str,
        adapter: &Arc<dyn ProviderAdapter>,
        request: &ProviderRequest,
    ) -> ProviderResult<()> {
        let estimated_tokens = request.estimated_tokens();
        let budget = self.budget(provider);
        let now = Instant::now();
        if budget.exhausted_at(now) || !budget.would_fit_at(estimated_tokens, now) {
            return Err(ProviderError::BudgetExceeded {
                provider: provider.to_string(),
            });
        }

        let estimated_cost = adapter
            .pricing(model)
            .cost(TokenUsage::new(estimated_tokens, 0))
            .total;
        let decision = self.admission.admit(&AdmitRequest {
            provider: provider.to_string(),
            agent: None,
            estimated_tokens,
            estimated_cost,
            priority: Priority::Normal,
        });
        if !decision.allowed {
            return Err(Self::admission_error(provider, decision));
        }
        Ok(())
    }

    /// Record spend and budget consumption for a settled response.
    fn settle(&self, provider: &str, response: &ProviderResponse) {
        let entry = SpendEntry {
            timestamp: chrono::Utc::now(),
            provider: provider.to_string(),
            tokens: response.usage.total_tokens,
            cost: response.cost.total,
        };
        if let Err(e) = self.spend.append(entry) {
            warn!(provider = %provider, error = %e, "spend append failed");
        }
        self.budget(provider).record(response.usage.total_tokens);
        info!(
            provider = %provider,
            tokens = response.usage.total_tokens,
            cost = response.cost.total,
            "request settled"
        );
    }

    /// Primary resolution plus the fallback chain, deduplicated.
    fn candidates(&self, request: &ProviderRequest) -> ProviderResult<Vec<(String, String)>> {
        let model = request
            .model
            .as_deref()
            .ok_or_else(|| ProviderError::InvalidRequest("no model specified".into()))?;

        let mut out = vec![self.resolve(model)?];
        for fallback in &self.fallback_chain {
            if let Ok(resolved) = self.resolve(fallback) {
                if !out.contains(&resolved) {
                    out.push(resolved);
                }
            }
        }
        Ok(out)
    }

    /// `provider/model` is already qualified; anything else goes through
    /// the routing table.
    fn resolve(&self, name: &str) -> ProviderResult<(String, String)> {
        let qualified = if name.contains('/') {
            name.to_string()
        } else {
            self.routes
                .get(name)
                .cloned()
                .ok_or_else(|| ProviderError::ModelNotFound(name.to_string()))?
        };
        let (provider, model) = qualified
            .split_once('/')
            .ok_or_else(|| ProviderError::ModelNotFound(qualified.clone()))?;
        Ok((provider.to_string(), model.to_string()))
    }

    fn admission_error(provider: &str, decision: AdmitDecision) -> ProviderError {
        use waggle_admission::AdmissionError;
        match decision.into_error() {
            Some(AdmissionError::RateLimited { retry_after, .. }) => ProviderError::RateLimit {
                provider: provider.to_string(),
                retry_after,
            },
            Some(AdmissionError::BudgetExceeded { .. }) => ProviderError::BudgetExceeded {
                provider: provider.to_string(),
            },
            Some(error) => ProviderError::Admission(error),
            None => ProviderError::Network("admission denied without reason".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{EchoAdapter, EchoTransport, TransportError};
    use crate::spend::MemorySpendLog;
    use crate::types::Message;
    use async_trait::async_trait;
    use waggle_config::AdmissionSection;

    /// Transport that fails `failures` times, then echoes; counts sends.
    struct FlakyTransport {
        failures: AtomicU64,
        status: u16,
        sends: AtomicU64,
    }

    impl FlakyTransport {
        fn new(failures: u64, status: u16) -> Self {
            Self {
                failures: AtomicU64::new(failures),
                status,
                sends: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(
            &self,
            payload: serde_json::Value,
        ) -> Result<serde_json::Value, TransportError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                f.checked_sub(1)
            }).is_ok()
            {
                return Err(TransportError {
                    status: Some(self.status),
                    message: "induced failure".into(),
                    timed_out: false,
                });
            }
            Ok(serde_json::json!({ "echo": payload }))
        }

        async fn open_stream(
            &self,
            _payload: serde_json::Value,
        ) -> Result<mpsc::Receiver<serde_json::Value>, TransportError> {
            Err(TransportError {
                status: Some(self.status),
                message: "no stream".into(),
                timed_out: false,
            })
        }
    }

    fn section(fallback: &[&str]) -> RouterSection {
        let mut section = RouterSection::default();
        section
            .routes
            .insert("fast".to_string(), "p1/fast-1".to_string());
        section.fallback_chain = fallback.iter().map(|s| s.to_string()).collect();
        section
    }

    fn router(section: &RouterSection) -> ProviderRouter {
        let admission = Arc::new(AdmissionController::new(&AdmissionSection::default()));
        ProviderRouter::new(section, admission, Arc::new(MemorySpendLog::new()))
    }

    fn request(model: &str) -> ProviderRequest {
        ProviderRequest::new(model, vec![Message::user("hello world")])
    }

    #[tokio::test]
    async fn test_complete_via_routing_table() {
        let r = router(&section(&[]));
        r.register_provider(Arc::new(EchoAdapter::new("p1")), Arc::new(EchoTransport));

        let response = r.complete(&request("fast")).await.unwrap();
        assert_eq!(response.model, "fast-1");
        assert!(response.cost.total > 0.0 || response.usage.total_tokens > 0);
        assert_eq!(r.stats().completions, 1);
    }

    #[tokio::test]
    async fn test_unknown_model_fails() {
        let r = router(&section(&[]));
        assert!(matches!(
            r.complete(&request("unknown")).await,
            Err(ProviderError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_provider() {
        let r = router(&section(&[]));
        let transport = Arc::new(FlakyTransport::new(0, 500));
        r.register_provider(Arc::new(EchoAdapter::new("p1")), transport.clone());

        let first = r.complete(&request("fast")).await.unwrap();
        let second = r.complete(&request("fast")).await.unwrap();
        assert_eq!(first, second);

        // Only one provider invocation; the second answer came from cache.
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
        assert_eq!(r.stats().cache.hits, 1);
    }

    #[tokio::test]
    async fn test_fallback_on_server_error() {
        let mut section = section(&["p2/backup-1"]);
        section
            .routes
            .insert("backup".to_string(), "p2/backup-1".to_string());
        let r = router(&section);
        r.register_provider(
            Arc::new(EchoAdapter::new("p1")),
            Arc::new(FlakyTransport::new(u64::MAX, 503)),
        );
        r.register_provider(Arc::new(EchoAdapter::new("p2")), Arc::new(EchoTransport));

        let response = r.complete(&request("fast")).await.unwrap();
        assert_eq!(response.model, "backup-1");
        assert_eq!(r.stats().failovers, 1);

        // Spend was recorded for the provider that answered.
        let spend = r.spend.entries().unwrap();
        assert_eq!(spend.len(), 1);
        assert_eq!(spend[0].provider, "p2");
    }

    #[tokio::test]
    async fn test_auth_error_surfaces_without_failover() {
        let section = section(&["p2/backup-1"]);
        let r = router(&section);
        r.register_provider(
            Arc::new(EchoAdapter::new("p1")),
            Arc::new(FlakyTransport::new(u64::MAX, 401)),
        );
        r.register_provider(Arc::new(EchoAdapter::new("p2")), Arc::new(EchoTransport));

        assert!(matches!(
            r.complete(&request("fast")).await,
            Err(ProviderError::Auth { .. })
        ));
        assert_eq!(r.stats().failovers, 0);
    }

    #[tokio::test]
    async fn test_budget_failover_records_only_fallback() {
        let mut section = section(&["p2/backup-1"]);
        section.daily_token_budget.insert("p1".to_string(), 100);
        let r = router(&section);
        r.register_provider(Arc::new(EchoAdapter::new("p1")), Arc::new(EchoTransport));
        r.register_provider(Arc::new(EchoAdapter::new("p2")), Arc::new(EchoTransport));

        // p1 is already at 99 of 100 tokens for the day.
        r.budget("p1").record(99);

        let response = r.complete(&request("fast")).await.unwrap();
        assert_eq!(response.model, "backup-1");

        let spend = r.spend.entries().unwrap();
        assert_eq!(spend.len(), 1);
        assert_eq!(spend[0].provider, "p2");
    }

    #[tokio::test]
    async fn test_stream_complete_delivers_terminal_done() {
        let r = router(&section(&[]));
        r.register_provider(Arc::new(EchoAdapter::new("p1")), Arc::new(EchoTransport));

        let stream = r.stream_complete(&request("fast")).await.unwrap();
        let (text, terminal) = stream.collect().await;
        assert!(!text.is_empty());
        match terminal {
            Some(StreamEvent::Done { usage, cost }) => {
                assert!(usage.total_tokens > 0);
                assert_eq!(cost.currency, "USD");
            }
            other => panic!("expected done, got {:?}", other),
        }
    }
}
