//! Provider router
//!
//! One request/response/stream contract over heterogeneous LLM backends.
//! Adapters translate between the uniform contract and each vendor's wire
//! payloads; transports carry those payloads, so the vendor protocol itself
//! stays outside this crate. The router resolves models, consults the
//! response cache, asks admission control, walks the fallback chain, and
//! records spend.

pub mod adapter;
pub mod cache;
pub mod error;
pub mod router;
pub mod spend;
pub mod stream;
pub mod types;

pub use adapter::{
    AdapterCapabilities, EchoAdapter, EchoTransport, Pricing, ProviderAdapter, Transport,
    TransportError,
};
pub use cache::{CacheStats, ResponseCache};
pub use error::{ProviderError, ProviderResult};
pub use router::{ProviderRouter, RouterStats};
pub use spend::{MemorySpendLog, SledSpendLog, SpendEntry, SpendLog, TokenBudget};
pub use stream::ResponseStream;
pub use types::{
    FinishReason, Message, ProviderRequest, ProviderResponse, RequestCost, Role, StreamEvent,
    TokenUsage, ToolCall,
};
