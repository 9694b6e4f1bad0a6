//! Backend forwarding with a per-backend circuit breaker.
//!
//! # Breaker state machine
//!
//! One machine per distinct backend URL:
//!
//! - **closed**: requests flow; a success resets the failure counter, a
//!   failure (5xx or transport error) increments it, and reaching the
//!   threshold opens the circuit.
//! - **open**: requests are rejected up front with 503 "Circuit breaker
//!   open" until the recovery window elapses, at which point the next call
//!   finds the breaker half-open.
//! - **half-open**: the call is attempted; success closes the circuit,
//!   failure reopens it and restarts the recovery window.
//!
//! 4xx responses are backend answers, not backend failures; they never move
//! the breaker. Health probes update liveness only — the breaker is moved
//! exclusively by real request outcomes.
//!
//! # Locking
//!
//! The registry map is under an outer RwLock for find-or-create; each
//! backend record has its own lock, and no lock is ever held across network
//! I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::metrics;

/// Deadline for health-check probes.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Headers never forwarded to a backend: hop-by-hop per RFC 7230 §6.1, plus
/// `host` and `content-length` which the client recomputes.
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Breaker position for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Liveness as reported by the background health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Mutable per-backend record, guarded by its own lock.
#[derive(Debug)]
struct BackendState {
    health: HealthStatus,
    circuit: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_check: Option<Instant>,
}

impl BackendState {
    fn new() -> Self {
        Self {
            health: HealthStatus::Unknown,
            circuit: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_check: None,
        }
    }
}

/// Result of a forwarded request.
///
/// `success` reports whether transport succeeded; a 500 from the backend is
/// still `success: true` with `status_code: 500`.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub success: bool,
    pub error: String,
    pub response_time_ms: u64,
}

impl ProxyResponse {
    fn failure(status_code: u16, error: impl Into<String>) -> Self {
        Self {
            status_code,
            headers: HeaderMap::new(),
            body: Vec::new(),
            success: false,
            error: error.into(),
            response_time_ms: 0,
        }
    }

    /// True when this is a breaker rejection rather than a call outcome.
    pub fn is_circuit_rejection(&self) -> bool {
        !self.success && self.error == "Circuit breaker open"
    }
}

/// Forwards requests to backends, tracking failures per backend URL.
///
/// One shared instance serves the whole gateway: per-request breakers would
/// lose all failure history.
pub struct ProxyManager {
    failure_threshold: u32,
    recovery_timeout: Duration,
    client: reqwest::Client,
    backends: RwLock<HashMap<String, Arc<Mutex<BackendState>>>>,
}

impl ProxyManager {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            client: reqwest::Client::new(),
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Forward one request through the breaker.
    pub async fn forward(
        &self,
        method: &str,
        backend_url: &str,
        path: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
        timeout_ms: u64,
    ) -> ProxyResponse {
        // Method support is a gateway property, not a backend outcome, so an
        // unsupported method never touches breaker state.
        let Some(method) = parse_method(method) else {
            return ProxyResponse::failure(0, format!("Unsupported HTTP method: {method}"));
        };

        if !self.admit(backend_url) {
            metrics::record_circuit_rejection(backend_url);
            return ProxyResponse::failure(503, "Circuit breaker open");
        }

        let started = Instant::now();
        let mut response = self
            .execute(method, backend_url, path, headers, body, timeout_ms)
            .await;
        response.response_time_ms = started.elapsed().as_millis() as u64;

        if response.success && response.status_code < 500 {
            self.record_success(backend_url);
        } else {
            self.record_failure(backend_url);
        }

        response
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        backend_url: &str,
        path: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
        timeout_ms: u64,
    ) -> ProxyResponse {
        let url = format!("{backend_url}{path}");

        let mut request = self
            .client
            .request(method, &url)
            .timeout(Duration::from_millis(timeout_ms));

        for (name, value) in headers {
            if STRIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        match request.send().await {
            Ok(upstream) => {
                let status_code = upstream.status().as_u16();
                let headers = upstream.headers().clone();
                match upstream.bytes().await {
                    Ok(bytes) => ProxyResponse {
                        status_code,
                        headers,
                        body: bytes.to_vec(),
                        success: true,
                        error: String::new(),
                        response_time_ms: 0,
                    },
                    Err(e) => ProxyResponse::failure(0, format!("Body read failed: {e}")),
                }
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Backend request failed");
                ProxyResponse::failure(0, format!("Request failed: {e}"))
            }
        }
    }

    /// Breaker gate, run before any I/O. Flips open -> half-open when the
    /// recovery window has elapsed.
    fn admit(&self, backend_url: &str) -> bool {
        let state = self.backend_state(backend_url);
        let mut state = state.lock();

        match state.circuit {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.recovery_timeout);
                if recovered {
                    state.circuit = CircuitState::HalfOpen;
                    info!(backend = backend_url, "Circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self, backend_url: &str) {
        let state = self.backend_state(backend_url);
        let mut state = state.lock();

        state.consecutive_failures = 0;
        state.health = HealthStatus::Healthy;

        if state.circuit != CircuitState::Closed {
            info!(backend = backend_url, "Circuit breaker closed");
        }
        state.circuit = CircuitState::Closed;
        state.opened_at = None;
    }

    fn record_failure(&self, backend_url: &str) {
        let state = self.backend_state(backend_url);
        let mut state = state.lock();

        state.health = HealthStatus::Unhealthy;

        match state.circuit {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.failure_threshold {
                    state.circuit = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    metrics::record_circuit_open(backend_url);
                    warn!(
                        backend = backend_url,
                        failures = state.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.circuit = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                metrics::record_circuit_open(backend_url);
                warn!(backend = backend_url, "Circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {
                // A straggler that was admitted before the circuit opened;
                // restart the recovery window.
                state.consecutive_failures += 1;
                state.opened_at = Some(Instant::now());
            }
        }
    }

    /// Probe `/health` on a backend and update its liveness record.
    ///
    /// Any 2xx-4xx answer proves the process is up; only 5xx or transport
    /// failure marks it unhealthy. The breaker is deliberately untouched.
    pub async fn health_check(&self, backend_url: &str) -> bool {
        let url = format!("{backend_url}/health");
        let healthy = match self
            .client
            .head(&url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().as_u16() < 500,
            Err(e) => {
                debug!(backend = backend_url, error = %e, "Health check failed");
                false
            }
        };

        let state = self.backend_state(backend_url);
        let mut state = state.lock();
        state.health = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        state.last_check = Some(Instant::now());
        healthy
    }

    /// True when the backend is both live and has a closed breaker.
    pub fn is_healthy(&self, backend_url: &str) -> bool {
        let state = self.backend_state(backend_url);
        let state = state.lock();
        state.health == HealthStatus::Healthy && state.circuit == CircuitState::Closed
    }

    pub fn circuit_state(&self, backend_url: &str) -> CircuitState {
        self.backend_state(backend_url).lock().circuit
    }

    /// Snapshot of every known backend for the health endpoint.
    pub fn backend_snapshot(&self) -> Vec<(String, HealthStatus, CircuitState)> {
        let backends = self.backends.read();
        let mut snapshot: Vec<_> = backends
            .iter()
            .map(|(url, state)| {
                let state = state.lock();
                (url.clone(), state.health, state.circuit)
            })
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Find-or-create under the registry lock; the handle's own lock is
    /// taken only after the registry lock is released.
    fn backend_state(&self, backend_url: &str) -> Arc<Mutex<BackendState>> {
        if let Some(state) = self.backends.read().get(backend_url) {
            return state.clone();
        }
        self.backends
            .write()
            .entry(backend_url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BackendState::new())))
            .clone()
    }
}

fn parse_method(method: &str) -> Option<reqwest::Method> {
    match method {
        "GET" => Some(reqwest::Method::GET),
        "POST" => Some(reqwest::Method::POST),
        "PUT" => Some(reqwest::Method::PUT),
        "DELETE" => Some(reqwest::Method::DELETE),
        "PATCH" => Some(reqwest::Method::PATCH),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const BACKEND: &str = "http://backend-a:3000";

    fn proxy(threshold: u32, recovery: Duration) -> ProxyManager {
        ProxyManager::new(threshold, recovery)
    }

    #[test]
    fn test_starts_closed_and_admits() {
        let p = proxy(3, Duration::from_secs(60));
        assert_eq!(p.circuit_state(BACKEND), CircuitState::Closed);
        assert!(p.admit(BACKEND));
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let p = proxy(3, Duration::from_secs(60));

        p.record_failure(BACKEND);
        p.record_failure(BACKEND);
        assert_eq!(p.circuit_state(BACKEND), CircuitState::Closed);

        p.record_failure(BACKEND);
        assert_eq!(p.circuit_state(BACKEND), CircuitState::Open);
        assert!(!p.admit(BACKEND));
    }

    #[test]
    fn test_success_resets_failure_counter() {
        let p = proxy(3, Duration::from_secs(60));

        p.record_failure(BACKEND);
        p.record_failure(BACKEND);
        p.record_success(BACKEND);

        p.record_failure(BACKEND);
        p.record_failure(BACKEND);
        assert_eq!(p.circuit_state(BACKEND), CircuitState::Closed);

        p.record_failure(BACKEND);
        assert_eq!(p.circuit_state(BACKEND), CircuitState::Open);
    }

    #[test]
    fn test_recovery_window_admits_probe_as_half_open() {
        let p = proxy(1, Duration::from_millis(30));

        p.record_failure(BACKEND);
        assert_eq!(p.circuit_state(BACKEND), CircuitState::Open);
        assert!(!p.admit(BACKEND));

        std::thread::sleep(Duration::from_millis(40));
        assert!(p.admit(BACKEND));
        assert_eq!(p.circuit_state(BACKEND), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let p = proxy(1, Duration::from_millis(30));

        p.record_failure(BACKEND);
        std::thread::sleep(Duration::from_millis(40));
        assert!(p.admit(BACKEND));

        p.record_success(BACKEND);
        assert_eq!(p.circuit_state(BACKEND), CircuitState::Closed);
        assert!(p.admit(BACKEND));
    }

    #[test]
    fn test_half_open_failure_reopens_with_fresh_window() {
        let p = proxy(1, Duration::from_millis(50));

        p.record_failure(BACKEND);
        std::thread::sleep(Duration::from_millis(60));
        assert!(p.admit(BACKEND));
        assert_eq!(p.circuit_state(BACKEND), CircuitState::HalfOpen);

        p.record_failure(BACKEND);
        assert_eq!(p.circuit_state(BACKEND), CircuitState::Open);
        // Window restarted: still rejecting immediately after the reopen.
        assert!(!p.admit(BACKEND));
    }

    #[test]
    fn test_backends_tracked_independently() {
        let p = proxy(1, Duration::from_secs(60));

        p.record_failure("http://backend-a:3000");
        assert_eq!(
            p.circuit_state("http://backend-a:3000"),
            CircuitState::Open
        );
        assert_eq!(
            p.circuit_state("http://backend-b:3000"),
            CircuitState::Closed
        );
        assert!(p.admit("http://backend-b:3000"));
    }

    #[tokio::test]
    async fn test_unsupported_method_is_not_a_breaker_failure() {
        let p = proxy(1, Duration::from_secs(60));

        let response = p
            .forward(
                "TRACE",
                BACKEND,
                "/x",
                &HeaderMap::new(),
                Vec::new(),
                1000,
            )
            .await;

        assert!(!response.success);
        assert!(response.error.contains("Unsupported HTTP method"));
        assert_eq!(p.circuit_state(BACKEND), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits_forward() {
        let p = proxy(1, Duration::from_secs(60));
        p.record_failure(BACKEND);

        let response = p
            .forward("GET", BACKEND, "/x", &HeaderMap::new(), Vec::new(), 1000)
            .await;

        assert!(response.is_circuit_rejection());
        assert_eq!(response.status_code, 503);
        assert_eq!(response.error, "Circuit breaker open");
    }

    #[test]
    fn test_is_healthy_requires_liveness_and_closed_breaker() {
        let p = proxy(1, Duration::from_secs(60));

        // Unknown liveness is not healthy.
        assert!(!p.is_healthy(BACKEND));

        p.record_success(BACKEND);
        assert!(p.is_healthy(BACKEND));

        p.record_failure(BACKEND);
        assert!(!p.is_healthy(BACKEND));
    }

    #[test]
    fn test_snapshot_lists_known_backends() {
        let p = proxy(1, Duration::from_secs(60));
        p.record_success("http://backend-b:1");
        p.record_failure("http://backend-a:1");

        let snapshot = p.backend_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "http://backend-a:1");
        assert_eq!(snapshot[0].1, HealthStatus::Unhealthy);
        assert_eq!(snapshot[1].2, CircuitState::Closed);
    }
}
