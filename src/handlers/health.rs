//! Built-in health endpoint.
//!
//! `GET /health` is served ahead of the gateway pipeline so load balancers
//! and orchestrators can probe the gateway itself without traversing policy.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::AppState;

/// Static JSON health report with per-component detail.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let backends: Value = state
        .proxy
        .backend_snapshot()
        .into_iter()
        .map(|(url, health, circuit)| {
            (
                url,
                json!({
                    "status": health.to_string(),
                    "circuit": circuit.to_string(),
                }),
            )
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Json(json!({
        "status": "healthy",
        "service": "api-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": timestamp,
        "uptime_seconds": state.uptime_seconds(),
        "components": {
            "jwt_manager": "healthy",
            "rate_limiter": "healthy",
            "router": "healthy",
            "cache": if state.cache.is_some() { "healthy" } else { "disabled" },
            "backends": backends,
        },
    }))
}
