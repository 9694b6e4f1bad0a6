//! Admin API: operational controls behind a bearer token.
//!
//! All `/admin/*` endpoints require `Authorization: Bearer <admin_token>`,
//! compared in constant time. The admin router is only mounted when
//! `admin.enabled` is set, so a disabled admin surface is indistinguishable
//! from an unknown route.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::state::AppState;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "Unauthorized: Invalid or missing admin token",
            "code": "UNAUTHORIZED",
        })),
    )
        .into_response()
}

/// Constant-time admin token check against the `Authorization` header.
fn verify_admin_token(state: &AppState, headers: &HeaderMap) -> bool {
    if state.config.admin.token.is_empty() {
        return false;
    }

    let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };

    token
        .as_bytes()
        .ct_eq(state.config.admin.token.as_bytes())
        .into()
}

/// `GET /admin/config`: redacted snapshot of the live configuration.
///
/// Secrets (JWT secret, API keys, Redis password, admin token) are omitted
/// rather than masked so they cannot leak through this surface at all.
pub async fn get_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !verify_admin_token(&state, &headers) {
        return unauthorized();
    }

    let config = &state.config;
    let snapshot = json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "max_connections": config.server.max_connections,
            "max_body_size": config.server.max_body_size,
            "tls_enabled": config.server.tls.enabled,
        },
        "rate_limits": {
            "global": config.rate_limits.global.map(|s| json!({"requests": s.requests, "window": s.window})),
            "per_ip": config.rate_limits.per_ip.map(|s| json!({"requests": s.requests, "window": s.window})),
            "endpoints": config.rate_limits.endpoints.keys().collect::<Vec<_>>(),
            "per_ip_connections": config.rate_limits.per_ip_connections,
        },
        "backends": {
            "failure_threshold": config.backends.circuit_breaker.failure_threshold,
            "recovery_timeout": config.backends.circuit_breaker.recovery_timeout,
            "health_check_interval": config.backends.health_check_interval,
        },
        "cache_enabled": config.cache.enabled,
        "redis_enabled": config.redis.enabled,
        "routes": state.routes.routes().iter().map(|r| r.pattern.clone()).collect::<Vec<_>>(),
    });

    Json(json!({ "config": snapshot, "timestamp": unix_now() })).into_response()
}

/// `POST /admin/config`: runtime reconfiguration is not supported; the
/// config is immutable once subsystems are built from it.
pub async fn update_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !verify_admin_token(&state, &headers) {
        return unauthorized();
    }

    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "error": "Runtime configuration updates are not supported; restart with a new config file",
            "code": "NOT_IMPLEMENTED",
        })),
    )
        .into_response()
}

/// `GET /admin/cache/stats`: key count and approximate payload size.
pub async fn cache_stats(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !verify_admin_token(&state, &headers) {
        return unauthorized();
    }

    let Some(cache) = &state.cache else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "Cache is not enabled",
                "code": "CACHE_DISABLED",
            })),
        )
            .into_response();
    };

    let stats = cache.stats().await;
    Json(json!({
        "keys": stats.keys,
        "approx_bytes": stats.approx_bytes,
        "timestamp": unix_now(),
    }))
    .into_response()
}

/// `POST /admin/cache/clear`: invalidate entries matching an optional glob
/// pattern (`{"pattern": "GET:/api/users/*"}`), everything by default.
pub async fn cache_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    if !verify_admin_token(&state, &headers) {
        return unauthorized();
    }

    let Some(cache) = &state.cache else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "Cache is not enabled",
                "code": "CACHE_DISABLED",
            })),
        )
            .into_response();
    };

    let pattern = body
        .as_ref()
        .and_then(|j| j.0.get("pattern"))
        .and_then(Value::as_str)
        .unwrap_or("*")
        .to_string();

    let removed = cache.invalidate_pattern(&pattern).await;
    info!(pattern = %pattern, removed, "Admin cache clear");

    Json(json!({
        "message": "Cache cleared",
        "pattern": pattern,
        "removed": removed,
        "timestamp": unix_now(),
    }))
    .into_response()
}

/// `POST /admin/ratelimit/reset`: drop the bucket for one client IP
/// (`{"key": "1.2.3.4"}`); the next request sees a full bucket.
pub async fn ratelimit_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    if !verify_admin_token(&state, &headers) {
        return unauthorized();
    }

    let Some(key) = body
        .as_ref()
        .and_then(|j| j.0.get("key"))
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Missing required field: key",
                "code": "MISSING_FIELD",
            })),
        )
            .into_response();
    };

    state.limiter.reset_key(&key).await;
    info!(key = %key, "Admin rate limit reset");

    Json(json!({
        "message": "Rate limit reset",
        "key": key,
        "timestamp": unix_now(),
    }))
    .into_response()
}
