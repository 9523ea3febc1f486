//! Provider adapter seam
//!
//! An adapter translates between the uniform contract and one vendor's wire
//! payloads; a transport moves those payloads. Keeping the two apart means
//! the vendor protocol, TLS, and authentication all live outside the core,
//! and tests can run against an in-process echo transport.

use crate::error::{ProviderError, ProviderResult};
use crate::types::{
    FinishReason, ProviderRequest, ProviderResponse, RequestCost, StreamEvent, TokenUsage,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// What a backend can do.
#[derive(Debug, Clone, Copy)]
pub struct AdapterCapabilities {
    pub streaming: bool,
    pub tools: bool,
    pub max_context_tokens: u32,
}

/// USD prices per thousand tokens.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl Pricing {
    pub fn cost(&self, usage: TokenUsage) -> RequestCost {
        let prompt = usage.prompt_tokens as f64 / 1000.0 * self.prompt_per_1k;
        let completion = usage.completion_tokens as f64 / 1000.0 * self.completion_per_1k;
        RequestCost {
            prompt,
            completion,
            total: prompt + completion,
            currency: "USD".to_string(),
        }
    }
}

/// Transport-level failure, classified by the adapter.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
    pub timed_out: bool,
}

/// Carries opaque wire payloads to and from one backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// One request, one response payload.
    async fn send(&self, payload: serde_json::Value) -> Result<serde_json::Value, TransportError>;

    /// One request, a sequence of chunk payloads. The receiver closing is
    /// the cancellation signal to the backend.
    async fn open_stream(
        &self,
        payload: serde_json::Value,
    ) -> Result<mpsc::Receiver<serde_json::Value>, TransportError>;
}

/// Translates the uniform contract to one vendor's wire format.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Prices for a model served by this provider.
    fn pricing(&self, model: &str) -> Pricing;

    /// Uniform request -> vendor wire payload.
    fn build_request(&self, request: &ProviderRequest, model: &str)
        -> ProviderResult<serde_json::Value>;

    /// Vendor response payload -> uniform response (without cost, which the
    /// router fills in from `pricing`).
    fn parse_response(&self, payload: serde_json::Value) -> ProviderResult<ProviderResponse>;

    /// Vendor stream chunk -> zero or one uniform events.
    fn parse_stream_chunk(&self, payload: serde_json::Value)
        -> ProviderResult<Option<StreamEvent>>;

    /// Fold a transport failure into the uniform classification.
    fn classify_error(&self, error: &TransportError) -> ProviderError {
        if error.timed_out {
            return ProviderError::Timeout;
        }
        match error.status {
            Some(401) | Some(403) => ProviderError::Auth {
                provider: self.name().to_string(),
                message: error.message.clone(),
            },
            Some(404) => ProviderError::ModelNotFound(error.message.clone()),
            Some(429) => ProviderError::RateLimit {
                provider: self.name().to_string(),
                retry_after: None,
            },
            Some(status) if status >= 500 => ProviderError::Server {
                status,
                message: error.message.clone(),
            },
            Some(status) if status >= 400 => ProviderError::InvalidRequest(error.message.clone()),
            _ => ProviderError::Network(error.message.clone()),
        }
    }
}

/// In-process transport that answers with a canned echo payload; the
/// default backend for tests and local development.
pub struct EchoTransport;

#[async_trait]
impl Transport for EchoTransport {
    async fn send(&self, payload: serde_json::Value) -> Result<serde_json::Value, TransportError> {
        Ok(serde_json::json!({ "echo": payload }))
    }

    async fn open_stream(
        &self,
        payload: serde_json::Value,
    ) -> Result<mpsc::Receiver<serde_json::Value>, TransportError> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let _ = tx.send(serde_json::json!({ "chunk": payload, "index": 0 })).await;
            let _ = tx.send(serde_json::json!({ "done": true })).await;
        });
        Ok(rx)
    }
}

/// Reference adapter over [`EchoTransport`]-shaped payloads. Real vendor
/// adapters implement the same five operations against their own wire
/// formats.
pub struct EchoAdapter {
    name: String,
    pricing: Pricing,
}

impl EchoAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pricing: Pricing {
                prompt_per_1k: 0.001,
                completion_per_1k: 0.002,
            },
        }
    }
}

impl ProviderAdapter for EchoAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            tools: false,
            max_context_tokens: 128_000,
        }
    }

    fn pricing(&self, _model: &str) -> Pricing {
        self.pricing
    }

    fn build_request(
        &self,
        request: &ProviderRequest,
        model: &str,
    ) -> ProviderResult<serde_json::Value> {
        if request.messages.is_empty() {
            return Err(ProviderError::InvalidRequest("no messages".into()));
        }
        Ok(serde_json::json!({
            "model": model,
            "prompt": request
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            "max_tokens": request.max_tokens,
        }))
    }

    fn parse_response(&self, payload: serde_json::Value) -> ProviderResult<ProviderResponse> {
        let echoed = payload
            .get("echo")
            .ok_or_else(|| ProviderError::Network("malformed echo payload".into()))?;
        let prompt = echoed
            .get("prompt")
            .and_then(|p| p.as_str())
            .unwrap_or_default();
        let model = echoed
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or("echo")
            .to_string();

        let usage = TokenUsage::new(prompt.len() as u64 / 4, 8);
        Ok(ProviderResponse {
            id: format!("echo-{}", prompt.len()),
            model,
            content: prompt.chars().rev().collect(),
            tool_calls: Vec::new(),
            usage,
            cost: RequestCost::default(),
            finish_reason: FinishReason::Stop,
        })
    }

    fn parse_stream_chunk(
        &self,
        payload: serde_json::Value,
    ) -> ProviderResult<Option<StreamEvent>> {
        if payload.get("done").is_some() {
            return Ok(Some(StreamEvent::Done {
                usage: TokenUsage::new(4, 8),
                cost: RequestCost::default(),
            }));
        }
        let delta = payload
            .get("chunk")
            .and_then(|c| c.get("prompt"))
            .and_then(|p| p.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(Some(StreamEvent::Content { delta }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn test_pricing_cost() {
        let pricing = Pricing {
            prompt_per_1k: 3.0,
            completion_per_1k: 15.0,
        };
        let cost = pricing.cost(TokenUsage::new(2000, 1000));
        assert!((cost.prompt - 6.0).abs() < 1e-9);
        assert!((cost.completion - 15.0).abs() < 1e-9);
        assert!((cost.total - 21.0).abs() < 1e-9);
        assert_eq!(cost.currency, "USD");
    }

    #[test]
    fn test_classify_by_status() {
        let adapter = EchoAdapter::new("echo");
        let error = |status: Option<u16>, timed_out: bool| TransportError {
            status,
            message: "m".into(),
            timed_out,
        };

        assert!(matches!(
            adapter.classify_error(&error(Some(401), false)),
            ProviderError::Auth { .. }
        ));
        assert!(matches!(
            adapter.classify_error(&error(Some(429), false)),
            ProviderError::RateLimit { .. }
        ));
        assert!(matches!(
            adapter.classify_error(&error(Some(500), false)),
            ProviderError::Server { .. }
        ));
        assert!(matches!(
            adapter.classify_error(&error(Some(400), false)),
            ProviderError::InvalidRequest(_)
        ));
        assert!(matches!(
            adapter.classify_error(&error(None, true)),
            ProviderError::Timeout
        ));
        assert!(matches!(
            adapter.classify_error(&error(None, false)),
            ProviderError::Network(_)
        ));
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let adapter = EchoAdapter::new("echo");
        let transport = EchoTransport;

        let request = ProviderRequest::new("echo/small", vec![Message::user("hello")]);
        let payload = adapter.build_request(&request, "small").unwrap();
        let raw = transport.send(payload).await.unwrap();
        let response = adapter.parse_response(raw).unwrap();

        assert_eq!(response.content, "olleh");
        assert_eq!(response.model, "small");
    }
}
