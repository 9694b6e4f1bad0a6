//! Prometheus metrics for gateway observability.
//!
//! The recorder is installed once at startup; `GET /metrics` renders the
//! exposition text from the returned handle, so the gateway serves its own
//! metrics endpoint instead of binding a second listener.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_requests_total` (method, path, status)
//! - `gateway_auth_success_total` / `gateway_auth_failures_total`
//! - `gateway_rate_limit_hits_total` / `gateway_rate_limit_allowed_total`
//! - `gateway_cache_hits_total` / `gateway_cache_misses_total`
//! - `gateway_backend_errors_total` (backend)
//! - `gateway_circuit_breaker_opens_total` (backend)
//! - `gateway_circuit_breaker_rejections_total` (backend)
//!
//! ## Histograms
//! - `gateway_request_duration_seconds` (method, status)
//! - `gateway_backend_latency_seconds` (backend)
//!
//! ## Gauges
//! - `gateway_active_connections`

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const BACKEND_LATENCY_SECONDS: &str = "gateway_backend_latency_seconds";
    pub const BACKEND_ERRORS_TOTAL: &str = "gateway_backend_errors_total";
    pub const AUTH_SUCCESS_TOTAL: &str = "gateway_auth_success_total";
    pub const AUTH_FAILURES_TOTAL: &str = "gateway_auth_failures_total";
    pub const RATE_LIMIT_HITS_TOTAL: &str = "gateway_rate_limit_hits_total";
    pub const RATE_LIMIT_ALLOWED_TOTAL: &str = "gateway_rate_limit_allowed_total";
    pub const CACHE_HITS_TOTAL: &str = "gateway_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "gateway_cache_misses_total";
    pub const CIRCUIT_OPENS_TOTAL: &str = "gateway_circuit_breaker_opens_total";
    pub const CIRCUIT_REJECTIONS_TOTAL: &str = "gateway_circuit_breaker_rejections_total";
    pub const ACTIVE_CONNECTIONS: &str = "gateway_active_connections";
}

/// Install the Prometheus recorder and describe every metric family.
///
/// Returns the handle the `/metrics` handler renders from.
pub fn init_metrics() -> Result<PrometheusHandle, String> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))?;

    describe_counter!(names::REQUESTS_TOTAL, "Requests by method, path, and status");
    describe_counter!(names::AUTH_SUCCESS_TOTAL, "Successful authentications");
    describe_counter!(names::AUTH_FAILURES_TOTAL, "Failed authentications");
    describe_counter!(names::RATE_LIMIT_HITS_TOTAL, "Requests rejected by the rate limiter");
    describe_counter!(names::RATE_LIMIT_ALLOWED_TOTAL, "Requests admitted by the rate limiter");
    describe_counter!(names::CACHE_HITS_TOTAL, "Responses served from cache");
    describe_counter!(names::CACHE_MISSES_TOTAL, "Cacheable requests that missed");
    describe_counter!(names::BACKEND_ERRORS_TOTAL, "Backend transport errors by backend");
    describe_counter!(names::CIRCUIT_OPENS_TOTAL, "Circuit breaker open transitions by backend");
    describe_counter!(
        names::CIRCUIT_REJECTIONS_TOTAL,
        "Requests rejected by an open circuit breaker"
    );

    describe_histogram!(names::REQUEST_DURATION_SECONDS, "Request duration in seconds");
    describe_histogram!(names::BACKEND_LATENCY_SECONDS, "Backend call latency in seconds");

    describe_gauge!(names::ACTIVE_CONNECTIONS, "Connections currently counted per the cap");

    Ok(handle)
}

// =============================================================================
// Counter recording functions
// =============================================================================

pub fn record_request(method: &str, path: &str, status: u16) {
    counter!(names::REQUESTS_TOTAL, "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string())
        .increment(1);
}

pub fn record_auth_success() {
    counter!(names::AUTH_SUCCESS_TOTAL).increment(1);
}

pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

pub fn record_rate_limit_hit() {
    counter!(names::RATE_LIMIT_HITS_TOTAL).increment(1);
}

pub fn record_rate_limit_allowed() {
    counter!(names::RATE_LIMIT_ALLOWED_TOTAL).increment(1);
}

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_backend_error(backend: &str) {
    counter!(names::BACKEND_ERRORS_TOTAL, "backend" => backend.to_string()).increment(1);
}

pub fn record_circuit_open(backend: &str) {
    counter!(names::CIRCUIT_OPENS_TOTAL, "backend" => backend.to_string()).increment(1);
}

pub fn record_circuit_rejection(backend: &str) {
    counter!(names::CIRCUIT_REJECTIONS_TOTAL, "backend" => backend.to_string()).increment(1);
}

// =============================================================================
// Histogram / gauge recording functions
// =============================================================================

pub fn record_request_duration(method: &str, status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

pub fn record_backend_latency(backend: &str, duration_secs: f64) {
    histogram!(names::BACKEND_LATENCY_SECONDS, "backend" => backend.to_string())
        .record(duration_secs);
}

pub fn set_active_connections(count: f64) {
    gauge!(names::ACTIVE_CONNECTIONS).set(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the recording functions are callable without an installed
    // recorder; exposition content is covered by integration tests.

    #[test]
    fn test_record_request() {
        record_request("GET", "/api/users", 200);
    }

    #[test]
    fn test_record_durations() {
        record_request_duration("GET", 200, 0.012);
        record_backend_latency("http://b:3000", 0.008);
    }

    #[test]
    fn test_record_outcome_counters() {
        record_auth_success();
        record_auth_failure();
        record_rate_limit_hit();
        record_rate_limit_allowed();
        record_cache_hit();
        record_cache_miss();
        record_backend_error("http://b:3000");
        record_circuit_open("http://b:3000");
        record_circuit_rejection("http://b:3000");
        set_active_connections(3.0);
    }
}
