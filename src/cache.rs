//! Post-hydration fetch cache
//!
//! Responses embedded in the initial document (and GET responses that declare a
//! `max-age`) are kept here until their time-to-live runs out, so load
//! functions re-running shortly after hydration do not hit the network again.
//! Entries are bounded with LRU eviction.

use crate::fetcher::Response;
use crate::trace_log;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Cache key: absolute URL plus the hash of the request body, if any
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    url: String,
    body_hash: Option<String>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: Response,
    expires_at: u64,
}

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub expired: usize,
    pub evictions: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Fetch cache with TTL expiry and LRU eviction
#[derive(Debug)]
pub struct FetchCache {
    entries: LruCache<CacheKey, CacheEntry>,
    stats: CacheStats,
}

impl FetchCache {
    const DEFAULT_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// A capacity of zero is treated as one
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            stats: CacheStats::default(),
        }
    }

    /// Cached response for a request, dropping it if it expired
    pub fn get(&mut self, url: &str, body_hash: Option<&str>, now_ms: u64) -> Option<Response> {
        let key = CacheKey {
            url: url.to_string(),
            body_hash: body_hash.map(str::to_string),
        };

        let cached = self
            .entries
            .get(&key)
            .map(|entry| (entry.expires_at, entry.response.clone()));

        match cached {
            Some((expires_at, response)) if now_ms < expires_at => {
                trace_log!("Fetch cache hit for {}", url);
                self.stats.hits += 1;
                Some(response)
            }
            Some(_) => {
                trace_log!("Fetch cache entry for {} expired", url);
                self.entries.pop(&key);
                self.stats.expired += 1;
                self.stats.misses += 1;
                None
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Store a response for `ttl_ms` milliseconds
    pub fn put(
        &mut self,
        url: &str,
        body_hash: Option<&str>,
        response: Response,
        ttl_ms: u64,
        now_ms: u64,
    ) {
        trace_log!("Caching {} for {}ms", url, ttl_ms);
        self.entries.put(
            CacheKey {
                url: url.to_string(),
                body_hash: body_hash.map(str::to_string),
            },
            CacheEntry {
                response,
                expires_at: now_ms.saturating_add(ttl_ms),
            },
        );
    }

    /// Drop every entry for `url`, whatever its body hash
    pub fn evict(&mut self, url: &str) {
        let stale: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(key, _)| key.url == url)
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            trace_log!("Evicting cached {}", url);
            self.entries.pop(&key);
            self.stats.evictions += 1;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Default for FetchCache {
    fn default() -> Self {
        Self::new()
    }
}
