use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Gateway-wide error types with appropriate HTTP status codes.
///
/// Every pipeline stage returns one of these on rejection; the pipeline never
/// unwinds through a panic. Client-facing bodies are always
/// `{"error": "...", "code": "..."}`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{message}")]
    Validation {
        message: String,
        code: &'static str,
        status: StatusCode,
    },

    #[error("Access denied")]
    IpBlocked,

    #[error("Too many connections")]
    ConnectionLimit,

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Route not found")]
    RouteNotFound,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Circuit breaker open")]
    CircuitOpen,

    #[error("Backend error: {0}")]
    BadGateway(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response body returned to clients.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: String,
}

impl GatewayError {
    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Validation { code, .. } => code,
            GatewayError::IpBlocked => "IP_BLOCKED",
            GatewayError::ConnectionLimit => "TOO_MANY_CONNECTIONS",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::RouteNotFound => "ROUTE_NOT_FOUND",
            GatewayError::Unauthorized => "UNAUTHORIZED",
            GatewayError::CircuitOpen => "CIRCUIT_OPEN",
            GatewayError::BadGateway(_) => "BAD_GATEWAY",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status this error surfaces as.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Validation { status, .. } => *status,
            GatewayError::IpBlocked => StatusCode::FORBIDDEN,
            GatewayError::ConnectionLimit => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Client errors are expected traffic; only 5xx without a backend cause
        // indicates a gateway bug.
        match &self {
            GatewayError::Internal(msg) => tracing::error!(error = %msg, "Internal error"),
            GatewayError::BadGateway(msg) => tracing::warn!(error = %msg, "Backend failure"),
            GatewayError::CircuitOpen => tracing::warn!("Rejected by open circuit breaker"),
            _ => {}
        }

        let body = ErrorBody {
            error: self.to_string(),
            code: self.code().to_string(),
        };

        match self {
            GatewayError::RateLimited { retry_after_secs } => (
                status,
                [("Retry-After", retry_after_secs.to_string())],
                axum::Json(body),
            )
                .into_response(),
            _ => (status, axum::Json(body)).into_response(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;
