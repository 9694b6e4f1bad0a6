//! Token-bucket rate limiting across global, per-IP, and per-endpoint scopes.
//!
//! # Algorithm
//!
//! Each bucket holds a real-valued token count refilled continuously at
//! `requests / window` tokens per second, capped at `requests`. The
//! fractional refill matters: a 2-per-minute limit refills ~0.033 tokens per
//! second, which integer arithmetic would truncate to zero forever.
//!
//! # Scopes
//!
//! A request consumes from every configured scope and is admitted only if
//! **all** of them have enough tokens. Consumption is all-or-nothing: the
//! per-bucket locks are taken in a fixed order (global, per-IP,
//! per-endpoint), every scope is checked, and only then are all scopes
//! decremented together, so a rejection in a later scope never leaks tokens
//! from an earlier one.
//!
//! # Shared store
//!
//! When a Redis store is attached, each scope check becomes a sliding-window
//! count against a sorted set instead of a local bucket. Connectivity loss
//! fails open: the request is admitted and a warning logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::LimitSpec;
use crate::redis_store::RedisStore;

/// Buckets idle at least this long are evicted by the GC, unless overridden.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// A single token bucket.
///
/// Invariants: `0 <= tokens <= capacity` after every operation.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: f64::from(capacity),
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn for_spec(spec: LimitSpec) -> Self {
        let rate = if spec.window > 0 {
            f64::from(spec.requests) / spec.window as f64
        } else {
            f64::from(spec.requests)
        };
        Self::new(spec.requests, rate)
    }

    /// Credit tokens for the time elapsed since the last refill.
    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.duration_since(self.last_refill).as_millis();
        if elapsed_ms > 0 {
            let added = self.refill_rate * elapsed_ms as f64 / 1000.0;
            self.tokens = (self.tokens + added).min(f64::from(self.capacity));
            self.last_refill = now;
        }
    }

    fn has(&self, cost: u32) -> bool {
        self.tokens >= f64::from(cost)
    }

    fn consume(&mut self, cost: u32) {
        self.tokens = (self.tokens - f64::from(cost)).max(0.0);
    }

    /// Seconds until one token becomes available, or the window on a
    /// zero-rate misconfiguration.
    fn retry_after(&self, window: u64) -> u64 {
        if self.refill_rate > 0.0 {
            (1.0 / self.refill_rate).ceil() as u64
        } else {
            window
        }
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.tokens
    }
}

type BucketMap = Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>;

/// Multi-scope token-bucket rate limiter.
///
/// Limits are installed once at startup; `allow_request` and the GC are the
/// only operations that run concurrently with traffic.
pub struct RateLimiter {
    global_config: Option<LimitSpec>,
    global_bucket: Option<Arc<Mutex<TokenBucket>>>,
    per_ip_config: Option<LimitSpec>,
    endpoint_configs: HashMap<String, LimitSpec>,
    ip_buckets: BucketMap,
    endpoint_buckets: BucketMap,
    idle_timeout: Duration,
    shared: Option<Arc<RedisStore>>,
}

impl RateLimiter {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            global_config: None,
            global_bucket: None,
            per_ip_config: None,
            endpoint_configs: HashMap::new(),
            ip_buckets: Mutex::new(HashMap::new()),
            endpoint_buckets: Mutex::new(HashMap::new()),
            idle_timeout,
            shared: None,
        }
    }

    /// Install the singleton global limit.
    pub fn set_global_limit(&mut self, requests: u32, window: u64) {
        let spec = LimitSpec { requests, window };
        self.global_config = Some(spec);
        self.global_bucket = Some(Arc::new(Mutex::new(TokenBucket::for_spec(spec))));
    }

    /// Install the per-client-IP limit; buckets are created lazily.
    pub fn set_per_ip_limit(&mut self, requests: u32, window: u64) {
        self.per_ip_config = Some(LimitSpec { requests, window });
    }

    /// Install a limit for one endpoint path, keyed per IP+endpoint.
    pub fn set_endpoint_limit(&mut self, endpoint: &str, requests: u32, window: u64) {
        self.endpoint_configs
            .insert(endpoint.to_string(), LimitSpec { requests, window });
    }

    /// Route limiter traffic through a shared Redis store (sliding window).
    pub fn set_shared_store(&mut self, store: Arc<RedisStore>) {
        self.shared = Some(store);
    }

    /// Admit or reject a request of `cost` tokens.
    ///
    /// Returns `(admitted, retry_after_secs)`; `retry_after_secs` is 0 when
    /// admitted, otherwise the wait suggested by the most-constraining
    /// rejecting scope.
    pub async fn allow_request(&self, client_ip: &str, endpoint: &str, cost: u32) -> (bool, u64) {
        if let Some(store) = &self.shared {
            return self.allow_request_shared(store, client_ip, endpoint).await;
        }
        self.allow_request_local(client_ip, endpoint, cost)
    }

    fn allow_request_local(&self, client_ip: &str, endpoint: &str, cost: u32) -> (bool, u64) {
        // Gather applicable scopes in the canonical lock order.
        let mut scopes: Vec<(Arc<Mutex<TokenBucket>>, LimitSpec)> = Vec::with_capacity(3);

        if let (Some(bucket), Some(config)) = (&self.global_bucket, self.global_config) {
            scopes.push((bucket.clone(), config));
        }
        if let Some(config) = self.per_ip_config {
            let bucket = find_or_create(&self.ip_buckets, client_ip, config);
            scopes.push((bucket, config));
        }
        if let Some(config) = self.endpoint_configs.get(endpoint) {
            let key = format!("{client_ip}:{endpoint}");
            let bucket = find_or_create(&self.endpoint_buckets, &key, *config);
            scopes.push((bucket, *config));
        }

        if scopes.is_empty() {
            return (true, 0);
        }

        // Hold every scope lock at once so check-then-consume is atomic
        // across scopes. Acquisition order is fixed, so no deadlock.
        let now = Instant::now();
        let mut guards: Vec<_> = scopes.iter().map(|(bucket, _)| bucket.lock()).collect();

        let mut retry_after: u64 = 0;
        for (guard, (_, config)) in guards.iter_mut().zip(scopes.iter()) {
            guard.refill(now);
            if !guard.has(cost) {
                retry_after = retry_after.max(guard.retry_after(config.window));
            }
        }

        if retry_after > 0 {
            debug!(client_ip, endpoint, retry_after, "Rate limit rejection");
            return (false, retry_after);
        }

        for guard in guards.iter_mut() {
            guard.consume(cost);
        }
        (true, 0)
    }

    async fn allow_request_shared(
        &self,
        store: &RedisStore,
        client_ip: &str,
        endpoint: &str,
    ) -> (bool, u64) {
        let mut scopes: Vec<(String, LimitSpec)> = Vec::with_capacity(3);

        if let Some(config) = self.global_config {
            scopes.push(("global".to_string(), config));
        }
        if let Some(config) = self.per_ip_config {
            scopes.push((format!("ip:{client_ip}"), config));
        }
        if let Some(config) = self.endpoint_configs.get(endpoint) {
            scopes.push((format!("{client_ip}:{endpoint}"), *config));
        }

        for (key, config) in scopes {
            match store
                .sliding_window_allow(&key, config.requests, config.window)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    let rate = f64::from(config.requests) / config.window.max(1) as f64;
                    let retry = if rate > 0.0 {
                        (1.0 / rate).ceil() as u64
                    } else {
                        config.window
                    };
                    return (false, retry.max(1));
                }
                Err(e) => {
                    // Fail open on shared-store trouble; local traffic keeps
                    // flowing while Redis recovers.
                    warn!(error = %e, key, "Shared rate limit check failed, admitting");
                }
            }
        }
        (true, 0)
    }

    /// Minimum refilled token count across the scopes configured for this
    /// IP/endpoint pair, without consuming anything.
    pub fn remaining(&self, client_ip: &str, endpoint: &str) -> u32 {
        let now = Instant::now();
        let mut minimum: Option<u32> = None;

        let mut observe = |tokens: f64| {
            let t = tokens.floor().max(0.0) as u32;
            minimum = Some(minimum.map_or(t, |m| m.min(t)));
        };

        if let Some(bucket) = &self.global_bucket {
            let mut guard = bucket.lock();
            guard.refill(now);
            observe(guard.tokens);
        }
        if let Some(config) = self.per_ip_config {
            match self.ip_buckets.lock().get(client_ip) {
                Some(bucket) => {
                    let mut guard = bucket.lock();
                    guard.refill(now);
                    observe(guard.tokens);
                }
                None => observe(f64::from(config.requests)),
            }
        }
        if let Some(config) = self.endpoint_configs.get(endpoint) {
            let key = format!("{client_ip}:{endpoint}");
            match self.endpoint_buckets.lock().get(&key) {
                Some(bucket) => {
                    let mut guard = bucket.lock();
                    guard.refill(now);
                    observe(guard.tokens);
                }
                None => observe(f64::from(config.requests)),
            }
        }

        minimum.unwrap_or_else(|| self.per_ip_config.map_or(0, |c| c.requests))
    }

    /// Drop the per-IP bucket; the next request recreates it at full capacity.
    pub async fn reset_key(&self, client_ip: &str) {
        self.ip_buckets.lock().remove(client_ip);
        if let Some(store) = &self.shared {
            store.reset_window(&format!("ip:{client_ip}")).await;
        }
    }

    /// Evict buckets idle longer than the configured timeout.
    ///
    /// Called by the background GC task; returns the number evicted.
    pub fn evict_idle(&self) -> usize {
        let cutoff = self.idle_timeout;
        let mut evicted = 0;

        for map in [&self.ip_buckets, &self.endpoint_buckets] {
            let mut buckets = map.lock();
            let before = buckets.len();
            buckets.retain(|_, bucket| bucket.lock().last_refill.elapsed() < cutoff);
            evicted += before - buckets.len();
        }

        if evicted > 0 {
            debug!(evicted, "Rate limiter GC evicted idle buckets");
        }
        evicted
    }

    /// Current number of live buckets across both keyed maps.
    pub fn bucket_count(&self) -> usize {
        self.ip_buckets.lock().len() + self.endpoint_buckets.lock().len()
    }
}

/// Find-or-create under the map lock, then hand back a bucket handle so the
/// map lock is released before any bucket lock is taken.
fn find_or_create(map: &BucketMap, key: &str, config: LimitSpec) -> Arc<Mutex<TokenBucket>> {
    let mut buckets = map.lock();
    buckets
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::for_spec(config))))
        .clone()
}
