//! # Portico
//!
//! An HTTP API gateway that terminates client traffic, enforces
//! cross-cutting policy, and forwards surviving requests to configured
//! backends, featuring:
//!
//! - **Rate limiting**: token buckets across global, per-IP, and
//!   per-endpoint scopes with all-or-nothing consumption
//! - **Routing**: ordered wildcard patterns with round-robin, random, or
//!   single-backend selection and prefix rewriting
//! - **Resilience**: a three-state circuit breaker per backend, fed by real
//!   request outcomes and complemented by background health probes
//! - **Caching**: TTL-bounded GET response cache, in-memory or Redis-backed
//! - **Security**: input validation, IP access control, per-IP connection
//!   caps, API-key and JWT authentication, log masking
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Axum HTTP Server                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Built-ins (/health, /metrics, /admin/*)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pipeline (IP → validate → rate limit → route → auth        │
//! │            → cache → proxy/breaker → decorate)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Subsystems (RateLimiter, RouteTable, ProxyManager,         │
//! │              ResponseCache, SecurityValidator, JwtManager)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backends (HTTP/1.1 upstreams)      Redis (optional)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use portico::{AppState, GatewayConfig, RouteTable, build_router, metrics};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), portico::GatewayError> {
//!     let config = GatewayConfig::load(std::path::Path::new("config/gateway.json"))?;
//!     let routes_doc = portico::config::load_json_file(std::path::Path::new("config/routes.json"))?;
//!     let routes = RouteTable::from_json(&routes_doc);
//!
//!     let handle = metrics::init_metrics().map_err(portico::GatewayError::Config)?;
//!     let state = AppState::new(config, routes, handle).await?;
//!     let app = build_router(state);
//!
//!     // Serve the router...
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod proxy;
pub mod redis_store;
pub mod router;
pub mod routes;
pub mod security;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use router::RouteTable;
pub use routes::build_router;
pub use state::AppState;
