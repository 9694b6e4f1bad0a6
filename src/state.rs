//! Shared application state for the gateway.
//!
//! One `AppState` is built at startup and cloned into every handler. It owns
//! the stateful subsystems (limiter, route table, proxy/breaker registry,
//! cache, validator) and the two background tasks:
//!
//! - the rate-limiter GC, which evicts idle buckets on a fixed interval;
//! - the health checker, which probes every configured backend and feeds the
//!   liveness side of the proxy registry.
//!
//! Background tasks are managed with `TaskTracker` and `CancellationToken`
//! so shutdown can stop them deterministically before the process exits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderName, HeaderValue};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthFailureLimiter, JwtManager};
use crate::cache::ResponseCache;
use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::limiter::RateLimiter;
use crate::proxy::ProxyManager;
use crate::redis_store::RedisStore;
use crate::router::RouteTable;
use crate::security::SecurityValidator;

/// Shared state cloned into every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub routes: Arc<RouteTable>,
    pub limiter: Arc<RateLimiter>,
    pub validator: Arc<SecurityValidator>,
    pub jwt: Arc<JwtManager>,
    pub auth_failures: Arc<AuthFailureLimiter>,
    pub proxy: Arc<ProxyManager>,
    /// Present only when `cache.enabled`.
    pub cache: Option<Arc<ResponseCache>>,
    /// Pre-parsed static security headers added to every response.
    pub security_headers: Arc<Vec<(HeaderName, HeaderValue)>>,
    pub metrics_handle: PrometheusHandle,
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Assemble all subsystems from configuration and start background tasks.
    pub async fn new(
        config: GatewayConfig,
        routes: RouteTable,
        metrics_handle: PrometheusHandle,
    ) -> GatewayResult<Self> {
        let config = Arc::new(config);
        let routes = Arc::new(routes);

        // The shared store is an accelerator, not a dependency: if Redis is
        // unreachable at startup the gateway runs on local state, matching
        // the fail-open contract for limiter and cache.
        let store = if config.redis.enabled {
            match RedisStore::connect(&config.redis_url()).await {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, falling back to local limiter/cache");
                    None
                }
            }
        } else {
            None
        };

        let mut limiter = RateLimiter::new(Duration::from_secs(config.rate_limits.idle_timeout));
        if let Some(spec) = config.rate_limits.global {
            limiter.set_global_limit(spec.requests, spec.window);
        }
        if let Some(spec) = config.rate_limits.per_ip {
            limiter.set_per_ip_limit(spec.requests, spec.window);
        }
        for (endpoint, spec) in &config.rate_limits.endpoints {
            limiter.set_endpoint_limit(endpoint, spec.requests, spec.window);
        }
        if let Some(store) = &store {
            limiter.set_shared_store(store.clone());
        }

        let validator = SecurityValidator::from_config(
            &config.security,
            config.server.max_body_size,
            config.rate_limits.per_ip_connections,
        );

        let jwt = JwtManager::from_config(&config.jwt)?;

        let proxy = ProxyManager::new(
            config.backends.circuit_breaker.failure_threshold,
            Duration::from_secs(config.backends.circuit_breaker.recovery_timeout),
        );

        let cache = if config.cache.enabled {
            let cache = match &store {
                Some(store) => ResponseCache::with_redis(store.clone()),
                None => ResponseCache::in_memory(),
            };
            Some(Arc::new(cache))
        } else {
            None
        };

        let security_headers = Arc::new(parse_security_headers(&config));

        let state = Self {
            config,
            routes,
            limiter: Arc::new(limiter),
            validator: Arc::new(validator),
            jwt: Arc::new(jwt),
            auth_failures: Arc::new(AuthFailureLimiter::new()),
            proxy: Arc::new(proxy),
            cache,
            security_headers,
            metrics_handle,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_limiter_gc_task();
        state.spawn_health_check_task();

        Ok(state)
    }

    /// Background GC for idle rate-limiter buckets.
    fn spawn_limiter_gc_task(&self) {
        let limiter = self.limiter.clone();
        let period = Duration::from_secs(self.config.rate_limits.cleanup_interval.max(1));
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // skip the immediate first tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Limiter GC task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = limiter.evict_idle();
                        trace!(evicted, live = limiter.bucket_count(), "Limiter GC pass");
                    }
                }
            }
        });
    }

    /// Background probe of every known backend.
    ///
    /// Probe results update liveness only; the breaker is moved by real
    /// request outcomes.
    fn spawn_health_check_task(&self) {
        let proxy = self.proxy.clone();
        let backends = self.routes.all_backends();
        let period = Duration::from_secs(self.config.backends.health_check_interval.max(1));
        let cancel = self.cancellation_token.clone();

        if backends.is_empty() {
            return;
        }

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Health check task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        for backend in &backends {
                            let healthy = proxy.health_check(backend).await;
                            trace!(backend, healthy, "Backend health probe");
                        }
                    }
                }
            }
        });
    }

    /// Gracefully stop background tasks; called after the listener drains.
    pub async fn shutdown(&self) {
        info!("Stopping background tasks");
        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        info!("All background tasks stopped");
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Translate configured snake_case header names into typed header pairs,
/// skipping anything unparseable rather than refusing to start.
fn parse_security_headers(config: &GatewayConfig) -> Vec<(HeaderName, HeaderValue)> {
    config
        .security_headers()
        .into_iter()
        .filter_map(|(name, value)| {
            let parsed_name = name.parse::<HeaderName>();
            let parsed_value = HeaderValue::from_str(&value);
            match (parsed_name, parsed_value) {
                (Ok(n), Ok(v)) => Some((n, v)),
                _ => {
                    warn!(header = %name, "Skipping unparseable security header");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> GatewayConfig {
        serde_json::from_value(json!({
            "server": {"host": "127.0.0.1", "port": 0},
            "jwt": {
                "secret": "0123456789abcdef0123456789abcdef",
                "issuer": "portico",
                "audience": "portico-clients"
            },
            "security": {
                "headers": {
                    "x_content_type_options": "nosniff",
                    "bad header name!": "value"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_security_headers_skips_invalid() {
        let headers = parse_security_headers(&test_config());
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0.as_str(), "x-content-type-options");
        assert_eq!(headers[0].1.to_str().unwrap(), "nosniff");
    }
}
