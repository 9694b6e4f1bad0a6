//! Router assembly: built-in endpoints, admin surface, and the pipeline.
//!
//! Registration order is part of the contract: `/health`, `/metrics`, and
//! `/admin/*` are bound as real routes before the catch-all pipeline
//! fallback, so the generic proxy path can never intercept them.
//!
//! Layer order (outermost first at request time):
//!
//! ```text
//! Request ID -> security headers -> trace -> CORS -> route/fallback
//! ```
//!
//! The request-id layer is outermost so even a response produced by another
//! layer carries `X-Request-ID`, and the security-header layer decorates
//! every response, including pipeline rejections and admin errors.

use axum::Router;
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{self, admin};
use crate::middleware::RequestIdLayer;
use crate::pipeline;
use crate::state::AppState;

/// Build the complete gateway router.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::export_metrics));

    if state.config.admin.enabled {
        info!("Admin API enabled at /admin/*");
        router = router.nest("/admin", admin_router());
    }

    // Everything else flows through the pipeline.
    router = router.fallback(pipeline::handle);

    if state.config.security.cors.enabled {
        info!("CORS enabled");
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router = router.layer(TraceLayer::new_for_http());
    router = router.layer(axum::middleware::map_response_with_state(
        state.clone(),
        add_security_headers,
    ));
    router = router.layer(RequestIdLayer::new());

    router.with_state(state)
}

fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/config", get(admin::get_config).post(admin::update_config))
        .route("/cache/stats", get(admin::cache_stats))
        .route("/cache/clear", post(admin::cache_clear))
        .route("/ratelimit/reset", post(admin::ratelimit_reset))
}

/// Stamp the configured static security headers onto every response.
async fn add_security_headers(State(state): State<AppState>, mut response: Response) -> Response {
    for (name, value) in state.security_headers.iter() {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response
}
