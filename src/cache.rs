//! Keyed response cache for GET traffic, in-memory or Redis-backed.
//!
//! Keys are `method:path` with the query string sorted and appended, so
//! `?a=1&b=2` and `?b=2&a=1` share an entry. Only the pipeline decides what
//! is cacheable (200 GET responses with a body); this module just stores,
//! expires, and invalidates.
//!
//! Cache failures are invisible to clients: a backend error on read is a
//! miss, and a write error is logged and discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::redis_store::RedisStore;

/// One cached response, as serialized into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub body: String,
    pub content_type: String,
    pub status_code: u16,
    /// Unix milliseconds at write time.
    pub cached_at: u64,
}

/// Key count and approximate payload bytes.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub keys: usize,
    pub approx_bytes: usize,
}

struct MemoryEntry {
    response: CachedResponse,
    stored_at: Instant,
    ttl: Duration,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

enum CacheBackend {
    Memory(RwLock<HashMap<String, MemoryEntry>>),
    Redis(Arc<RedisStore>),
}

/// Response cache with interchangeable local and shared backends.
pub struct ResponseCache {
    backend: CacheBackend,
}

impl ResponseCache {
    pub fn in_memory() -> Self {
        Self {
            backend: CacheBackend::Memory(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_redis(store: Arc<RedisStore>) -> Self {
        Self {
            backend: CacheBackend::Redis(store),
        }
    }

    /// Canonical cache key: `GET:/api/users?a=1&b=2` with query pairs sorted.
    pub fn key(method: &str, path: &str, query: Option<&str>) -> String {
        match query.filter(|q| !q.is_empty()) {
            Some(query) => {
                let mut pairs: Vec<&str> = query.split('&').collect();
                pairs.sort_unstable();
                format!("{method}:{path}?{}", pairs.join("&"))
            }
            None => format!("{method}:{path}"),
        }
    }

    /// Fetch a live entry; expired entries are deleted on the way out.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        match &self.backend {
            CacheBackend::Memory(map) => {
                {
                    let entries = map.read();
                    match entries.get(key) {
                        Some(entry) if !entry.is_expired() => {
                            return Some(entry.response.clone());
                        }
                        Some(_) => {} // expired, fall through to delete
                        None => return None,
                    }
                }
                map.write().remove(key);
                None
            }
            CacheBackend::Redis(store) => match store.cache_get(key).await {
                Ok(Some(raw)) => match serde_json::from_str(&raw) {
                    Ok(response) => Some(response),
                    Err(e) => {
                        warn!(error = %e, key, "Discarding undecodable cache entry");
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    // Indistinguishable from a miss by design.
                    warn!(error = %e, key, "Cache read failed");
                    None
                }
            },
        }
    }

    pub async fn set(&self, key: &str, response: CachedResponse, ttl: Duration) {
        match &self.backend {
            CacheBackend::Memory(map) => {
                map.write().insert(
                    key.to_string(),
                    MemoryEntry {
                        response,
                        stored_at: Instant::now(),
                        ttl,
                    },
                );
            }
            CacheBackend::Redis(store) => {
                let serialized = match serde_json::to_string(&response) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, key, "Could not serialize cache entry");
                        return;
                    }
                };
                if let Err(e) = store
                    .cache_set(key, &serialized, ttl.as_secs().max(1))
                    .await
                {
                    warn!(error = %e, key, "Cache write failed");
                }
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        match &self.backend {
            CacheBackend::Memory(map) => {
                map.write().remove(key);
            }
            CacheBackend::Redis(store) => {
                if let Err(e) = store.cache_del(key).await {
                    warn!(error = %e, key, "Cache invalidation failed");
                }
            }
        }
    }

    /// Delete all entries matching a glob (`GET:/api/users/*`); returns how
    /// many were removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        match &self.backend {
            CacheBackend::Memory(map) => {
                let Some(matcher) = glob_to_regex(pattern) else {
                    warn!(pattern, "Unusable cache invalidation pattern");
                    return 0;
                };
                let mut entries = map.write();
                let before = entries.len();
                entries.retain(|key, _| !matcher.is_match(key));
                let removed = before - entries.len();
                debug!(pattern, removed, "Invalidated cache entries");
                removed
            }
            CacheBackend::Redis(store) => match store.cache_delete_pattern(pattern).await {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(error = %e, pattern, "Pattern invalidation failed");
                    0
                }
            },
        }
    }

    pub async fn stats(&self) -> CacheStats {
        match &self.backend {
            CacheBackend::Memory(map) => {
                let entries = map.read();
                let approx_bytes = entries
                    .values()
                    .map(|e| e.response.body.len() + e.response.content_type.len())
                    .sum();
                CacheStats {
                    keys: entries.len(),
                    approx_bytes,
                }
            }
            CacheBackend::Redis(store) => match store.cache_stats().await {
                Ok((keys, approx_bytes)) => CacheStats { keys, approx_bytes },
                Err(e) => {
                    warn!(error = %e, "Cache stats unavailable");
                    CacheStats {
                        keys: 0,
                        approx_bytes: 0,
                    }
                }
            },
        }
    }
}

/// `GET:/api/users/*` -> anchored regex with `*` as the only wildcard.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    for c in pattern.chars() {
        match c {
            '*' => translated.push_str(".*"),
            '.' | '^' | '$' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                translated.push('\\');
                translated.push(c);
            }
            _ => translated.push(c),
        }
    }
    Regex::new(&format!("^{translated}$")).ok()
}
