//! The request pipeline: every stage a request passes through, in order.
//!
//! Stage order is contractual and enforced by this one function:
//!
//! 1. request-id stamping (done by [`crate::middleware::RequestIdLayer`])
//! 2. client IP derivation
//! 3. IP allow/deny -> 403
//! 4. per-IP connection cap -> 503
//! 5. method, path, header, body validation -> validator's code
//! 6. rate limit -> 429 with Retry-After
//! 7. route match -> 404
//! 8. auth when the route requires it -> 401
//! 9. cache lookup (GET) -> short-circuit on hit
//! 10. proxy through the circuit breaker -> 503 when open, 502 on transport
//! 11. cache store for 200 GET responses
//! 12. metrics and one structured log line per request
//!
//! A failure at any stage short-circuits with its specific status code; no
//! later stage runs, so a request that fails validation can never reach a
//! backend, touch the cache, or consume rate-limit tokens.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::info;

use crate::cache::{CachedResponse, ResponseCache};
use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::middleware;
use crate::security::ConnectionGuard;
use crate::state::AppState;

/// Hop-by-hop response headers the gateway must not relay.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Fields accumulated across stages for the per-request log line.
#[derive(Default)]
struct RequestLog {
    user_id: String,
    backend: String,
    error: String,
}

/// Fallback handler: everything not matched by a built-in endpoint.
pub async fn handle(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let started = Instant::now();
    let request_id = middleware::request_id(&req).to_string();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let client_ip = client_ip(req.headers(), peer);

    let mut log = RequestLog::default();
    let result = process(&state, req, &client_ip, &mut log).await;

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            if log.error.is_empty() {
                log.error = err.to_string();
            }
            err.into_response()
        }
    };

    let status = response.status().as_u16();
    let duration = started.elapsed();

    metrics::record_request(&method, &path, status);
    metrics::record_request_duration(&method, status, duration.as_secs_f64());

    info!(
        request_id = %request_id,
        client_ip = %client_ip,
        method = %method,
        path = %path,
        status,
        duration_ms = duration.as_millis() as u64,
        user_id = %log.user_id,
        backend = %log.backend,
        error = %log.error,
        "Request completed"
    );

    response
}

async fn process(
    state: &AppState,
    req: Request,
    client_ip: &str,
    log: &mut RequestLog,
) -> GatewayResult<Response> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    // CORS preflights are answered at the edge, before any policy applies.
    if method == axum::http::Method::OPTIONS {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    // Stage: IP allow/deny.
    if !state.validator.is_ip_allowed(client_ip) {
        return Err(GatewayError::IpBlocked);
    }

    // Stage: per-IP connection cap. The guard releases the slot when the
    // request finishes, including on every early return below.
    let _connection = ConnectionGuard::acquire(state.validator.clone(), client_ip)
        .ok_or(GatewayError::ConnectionLimit)?;

    // Stage: method, path, header validation.
    state.validator.validate_method(method.as_str())?;
    state.validator.validate_path(&path)?;
    let (parts, body) = req.into_parts();
    state.validator.validate_headers(&parts.headers)?;

    // Stage: body validation. Buffering is bounded by the configured limit;
    // anything larger is rejected without being read further.
    let body = axum::body::to_bytes(body, state.config.server.max_body_size)
        .await
        .map_err(|_| GatewayError::Validation {
            message: "Request body too large".to_string(),
            code: "BODY_TOO_LARGE",
            status: StatusCode::BAD_REQUEST,
        })?;
    state.validator.validate_body(&body)?;

    // Stage: rate limiting.
    let (admitted, retry_after_secs) = state.limiter.allow_request(client_ip, &path, 1).await;
    if !admitted {
        metrics::record_rate_limit_hit();
        return Err(GatewayError::RateLimited { retry_after_secs });
    }
    metrics::record_rate_limit_allowed();

    // Stage: route match.
    let matched = state
        .routes
        .match_route(&path)
        .ok_or(GatewayError::RouteNotFound)?;

    // Stage: authentication, when the route asks for it.
    if matched.route.require_auth {
        log.user_id = authenticate(state, &parts.headers, client_ip)?;
    }

    // Internal-handler routes have no backend; the built-ins they refer to
    // are registered ahead of this pipeline.
    let Some(backend_url) = matched.backend_url else {
        return Err(GatewayError::Validation {
            message: "Handler not implemented".to_string(),
            code: "HANDLER_NOT_IMPLEMENTED",
            status: StatusCode::NOT_FOUND,
        });
    };
    log.backend = backend_url.clone();

    // Stage: cache lookup for GETs.
    let cache_key = ResponseCache::key(method.as_str(), &path, query.as_deref());
    let cacheable = method == axum::http::Method::GET && state.cache.is_some();
    if cacheable {
        if let Some(cache) = &state.cache {
            if let Some(hit) = cache.get(&cache_key).await {
                metrics::record_cache_hit();
                log.backend = "cache".to_string();
                return Ok(cached_response(hit));
            }
        }
    }

    // Stage: forward through the circuit breaker.
    let proxied = state
        .proxy
        .forward(
            method.as_str(),
            &backend_url,
            &matched.rewritten_path,
            &parts.headers,
            body.to_vec(),
            matched.route.timeout_ms,
        )
        .await;

    metrics::record_backend_latency(
        &backend_url,
        Duration::from_millis(proxied.response_time_ms).as_secs_f64(),
    );

    if proxied.is_circuit_rejection() {
        return Err(GatewayError::CircuitOpen);
    }
    if !proxied.success {
        metrics::record_backend_error(&backend_url);
        return Err(GatewayError::BadGateway(proxied.error));
    }

    // Stage: cache store for successful GETs with a body.
    let mut response = axum::http::Response::builder()
        .status(StatusCode::from_u16(proxied.status_code).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in &proxied.headers {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        response = response.header(name, value);
    }

    if cacheable && proxied.status_code == 200 && !proxied.body.is_empty() {
        if let Some(cache) = &state.cache {
            let ttl = matched
                .route
                .cache_ttl
                .unwrap_or(state.config.cache.default_ttl);
            let entry = CachedResponse {
                body: String::from_utf8_lossy(&proxied.body).into_owned(),
                content_type: proxied
                    .headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/json")
                    .to_string(),
                status_code: proxied.status_code,
                cached_at: unix_millis(),
            };
            cache.set(&cache_key, entry, Duration::from_secs(ttl)).await;
        }
        metrics::record_cache_miss();
        response = response.header("X-Cache", "MISS");
    }

    response
        .body(Body::from(proxied.body))
        .map_err(|e| GatewayError::Internal(format!("Response build failed: {e}")))
}

/// Authenticate via API key or bearer token; fills the log's user id.
fn authenticate(state: &AppState, headers: &HeaderMap, client_ip: &str) -> GatewayResult<String> {
    // An IP that keeps failing gets blocked before we validate anything.
    if let Err(retry_after_secs) = state.auth_failures.check(client_ip) {
        metrics::record_auth_failure();
        return Err(GatewayError::RateLimited { retry_after_secs });
    }

    if let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok())
        && let Some(identity) = state.validator.validate_api_key(api_key)
    {
        metrics::record_auth_success();
        return Ok(identity.to_string());
    }

    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())
        && let Some(token) = auth.strip_prefix("Bearer ")
        && let Ok(user) = state.jwt.validate_token(token)
    {
        metrics::record_auth_success();
        return Ok(user.user_id);
    }

    state.auth_failures.record_failure(client_ip);
    metrics::record_auth_failure();
    Err(GatewayError::Unauthorized)
}

/// Build a response from a cache hit.
fn cached_response(hit: CachedResponse) -> Response {
    let status = StatusCode::from_u16(hit.status_code).unwrap_or(StatusCode::OK);
    (
        status,
        [
            (header::CONTENT_TYPE.as_str(), hit.content_type),
            ("X-Cache", "HIT".to_string()),
        ],
        hit.body,
    )
        .into_response()
}

/// Derive the client IP: first hop of `X-Forwarded-For`, else `X-Real-IP`,
/// else the transport peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
        && !first.trim().is_empty()
    {
        return first.trim().to_string();
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return value.trim().to_string();
    }

    peer.ip().to_string()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "203.0.113.9:54321".parse().unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.7, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.1"));

        assert_eq!(client_ip(&headers, peer()), "198.51.100.7");
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.1"));

        assert_eq!(client_ip(&headers, peer()), "192.0.2.1");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        assert_eq!(client_ip(&HeaderMap::new(), peer()), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_trims_whitespace() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("  198.51.100.7 , 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, peer()), "198.51.100.7");
    }

    #[test]
    fn test_client_ip_ignores_empty_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(""));
        assert_eq!(client_ip(&headers, peer()), "203.0.113.9");
    }

    #[test]
    fn test_cached_response_carries_hit_header() {
        let response = cached_response(CachedResponse {
            body: "{}".to_string(),
            content_type: "application/json".to_string(),
            status_code: 200,
            cached_at: 0,
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-cache").unwrap().to_str().unwrap(),
            "HIT"
        );
    }
}
