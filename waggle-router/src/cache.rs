//! Response cache
//!
//! Exact-match only: the key is a sha256 digest over the resolved model,
//! the normalized message sequence, and the sampling parameters. Entries
//! expire after the TTL; when the cache is full the oldest expired entry is
//! evicted first, falling back to plain LRU.

use crate::types::{ProviderRequest, ProviderResponse};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use waggle_config::CacheSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

struct CachedEntry {
    response: ProviderResponse,
    inserted_at: Instant,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Bounded TTL response cache.
pub struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    entries: Mutex<LruCache<CacheKey, CachedEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(section: &CacheSection) -> Self {
        let capacity = NonZeroUsize::new(section.max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            enabled: section.enabled,
            ttl: Duration::from_millis(section.ttl_ms),
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Key over everything that makes a completion deterministic-equal.
    pub fn key(model: &str, request: &ProviderRequest) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0]);
        for message in &request.messages {
            hasher.update(format!("{:?}", message.role).as_bytes());
            hasher.update([1]);
            hasher.update(message.content.trim().as_bytes());
            hasher.update([2]);
        }
        hasher.update(format!(
            "t={:?};p={:?};m={:?};s={:?}",
            request.temperature, request.top_p, request.max_tokens, request.stop_sequences
        ));
        CacheKey(hasher.finalize().into())
    }

    pub fn get(&self, key: &CacheKey) -> Option<ProviderResponse> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<ProviderResponse> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock();
        let hit = match entries.get(key) {
            Some(entry) if now.saturating_duration_since(entry.inserted_at) < self.ttl => {
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        drop(entries);

        match &hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    pub fn put(&self, key: CacheKey, response: ProviderResponse) {
        self.put_at(key, response, Instant::now())
    }

    pub fn put_at(&self, key: CacheKey, response: ProviderResponse, now: Instant) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock();

        // Prefer evicting something already expired over the LRU victim.
        if entries.len() == entries.cap().get() {
            let expired: Option<CacheKey> = entries
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.inserted_at) >= self.ttl)
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| *k);
            if let Some(victim) = expired {
                entries.pop(&victim);
            }
        }

        entries.put(
            key,
            CachedEntry {
                response,
                inserted_at: now,
            },
        );
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FinishReason, Message, RequestCost, TokenUsage};

    fn response(id: &str) -> ProviderResponse {
        ProviderResponse {
            id: id.to_string(),
            model: "m".into(),
            content: "c".into(),
            tool_calls: Vec::new(),
            usage: TokenUsage::new(1, 1),
            cost: RequestCost::default(),
            finish_reason: FinishReason::Stop,
        }
    }

    fn section(max_entries: usize, ttl_ms: u64) -> CacheSection {
        CacheSection {
            enabled: true,
            ttl_ms,
            max_entries,
        }
    }

    fn request(content: &str) -> ProviderRequest {
        ProviderRequest {
            messages: vec![Message::user(content)],
            temperature: Some(0.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_key_equality_tracks_content() {
        let a = ResponseCache::key("m", &request("hello"));
        let b = ResponseCache::key("m", &request("hello"));
        let c = ResponseCache::key("m", &request("world"));
        let d = ResponseCache::key("other", &request("hello"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_key_tracks_sampling_flags() {
        let mut warm = request("hello");
        warm.temperature = Some(0.9);
        assert_ne!(
            ResponseCache::key("m", &request("hello")),
            ResponseCache::key("m", &warm)
        );
    }

    #[test]
    fn test_hit_within_ttl_and_expiry() {
        let cache = ResponseCache::new(&section(4, 1_000));
        let key = ResponseCache::key("m", &request("q"));
        let t0 = Instant::now();

        cache.put_at(key, response("r1"), t0);
        assert_eq!(
            cache.get_at(&key, t0 + Duration::from_millis(500)).map(|r| r.id),
            Some("r1".to_string())
        );
        assert!(cache
            .get_at(&key, t0 + Duration::from_millis(1_500))
            .is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expired_evicted_before_lru() {
        let cache = ResponseCache::new(&section(2, 1_000));
        let t0 = Instant::now();
        let old = ResponseCache::key("m", &request("old"));
        let fresh = ResponseCache::key("m", &request("fresh"));
        let new = ResponseCache::key("m", &request("new"));

        cache.put_at(old, response("old"), t0);
        cache.put_at(fresh, response("fresh"), t0 + Duration::from_millis(900));
        // Touch `old` so `fresh` is the LRU candidate; by the time of the
        // next put, `old` has expired and should be the victim anyway.
        cache.get_at(&old, t0 + Duration::from_millis(950));
        cache.put_at(new, response("new"), t0 + Duration::from_millis(1_100));

        assert!(cache
            .get_at(&fresh, t0 + Duration::from_millis(1_200))
            .is_some());
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let mut section = section(4, 1_000);
        section.enabled = false;
        let cache = ResponseCache::new(&section);
        let key = ResponseCache::key("m", &request("q"));
        cache.put(key, response("r"));
        assert!(cache.get(&key).is_none());
    }
}
