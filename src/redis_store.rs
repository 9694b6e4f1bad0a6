//! Shared Redis backend for the rate limiter and response cache.
//!
//! The gateway treats Redis as an opaque, optional accelerator: every
//! operation carries a short deadline, and callers translate connectivity
//! errors into fail-open behavior (limiter admits, cache misses). Nothing in
//! the hot path may block on a dead store.
//!
//! The limiter side uses one sorted set per key where the score and member
//! are a millisecond timestamp: old entries are evicted, the survivors are
//! counted against the limit, and the current timestamp is appended — all in
//! one atomic pipeline.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, RedisError, RedisResult};
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};

/// Deadline applied to connection establishment and each command.
const SOCKET_TIMEOUT: Duration = Duration::from_millis(100);

/// Key namespace for limiter sorted sets.
const RATE_PREFIX: &str = "ratelimit:";

/// Key namespace for cached responses.
const CACHE_PREFIX: &str = "cache:";

/// Page size for SCAN-based enumeration, keeping each round trip bounded.
const SCAN_PAGE_SIZE: usize = 100;

/// Thin async client over a managed Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server responds; startup fails loudly rather
    /// than discovering a bad URI on the first request.
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::Config(format!("Invalid Redis URI: {e}")))?;

        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(SOCKET_TIMEOUT)
            .set_response_timeout(SOCKET_TIMEOUT);

        let conn = ConnectionManager::new_with_config(client, config)
            .await
            .map_err(|e| GatewayError::Config(format!("Redis connection failed: {e}")))?;

        let store = Self { conn };
        if !store.ping().await {
            return Err(GatewayError::Config(
                "Redis did not answer PING at startup".to_string(),
            ));
        }

        info!(url, "Connected to Redis shared store");
        Ok(store)
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    // =========================================================================
    // Sliding-window rate limiting
    // =========================================================================

    /// Count requests for `key` in the trailing window and record this one.
    ///
    /// Returns `Ok(true)` when the request is within the limit. Errors are
    /// returned to the caller, which fails open.
    pub async fn sliding_window_allow(
        &self,
        key: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> Result<bool, RedisError> {
        let mut conn = self.conn.clone();
        let full_key = format!("{RATE_PREFIX}{key}");
        let now_ms = unix_millis();
        let window_start = now_ms.saturating_sub(window_secs * 1000);

        let (_evicted, count, _added, _expired): (i64, i64, i64, i64) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&full_key)
            .arg(0)
            .arg(window_start)
            .cmd("ZCOUNT")
            .arg(&full_key)
            .arg(window_start)
            .arg(now_ms)
            .cmd("ZADD")
            .arg(&full_key)
            .arg(now_ms)
            .arg(now_ms)
            .cmd("EXPIRE")
            .arg(&full_key)
            .arg(window_secs + 1)
            .query_async(&mut conn)
            .await?;

        // The count predates the ZADD, so the current request is admitted
        // while count < limit.
        Ok(count < i64::from(max_requests))
    }

    /// Forget a limiter key entirely (admin reset).
    pub async fn reset_window(&self, key: &str) {
        let mut conn = self.conn.clone();
        let full_key = format!("{RATE_PREFIX}{key}");
        if let Err(e) = conn.del::<_, ()>(&full_key).await {
            warn!(error = %e, key, "Failed to reset rate limit key in Redis");
        }
    }

    // =========================================================================
    // Response cache
    // =========================================================================

    pub async fn cache_get(&self, key: &str) -> Result<Option<String>, RedisError> {
        let mut conn = self.conn.clone();
        conn.get(format!("{CACHE_PREFIX}{key}")).await
    }

    pub async fn cache_set(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        conn.set_ex(format!("{CACHE_PREFIX}{key}"), value, ttl_secs)
            .await
    }

    pub async fn cache_del(&self, key: &str) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        conn.del(format!("{CACHE_PREFIX}{key}")).await
    }

    /// Delete every cached key matching a glob pattern, in bounded pages.
    pub async fn cache_delete_pattern(&self, pattern: &str) -> Result<usize, RedisError> {
        let keys = self.scan_keys(&format!("{CACHE_PREFIX}{pattern}")).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let deleted = keys.len();
        conn.del::<_, ()>(keys).await?;
        Ok(deleted)
    }

    /// Key count and approximate total value bytes under the cache prefix.
    pub async fn cache_stats(&self) -> Result<(usize, usize), RedisError> {
        let keys = self.scan_keys(&format!("{CACHE_PREFIX}*")).await?;
        let mut conn = self.conn.clone();

        let mut total_bytes = 0usize;
        for key in &keys {
            let len: usize = conn.strlen(key).await.unwrap_or(0);
            total_bytes += len;
        }
        Ok((keys.len(), total_bytes))
    }

    async fn scan_keys(&self, pattern: &str) -> RedisResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE_SIZE)
                .query_async(&mut conn)
                .await?;

            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
