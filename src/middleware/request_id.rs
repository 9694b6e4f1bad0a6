//! Request ID middleware for log correlation.
//!
//! Every request entering the gateway is stamped with a freshly generated
//! UUIDv4 before any other processing. The id is written into the request
//! headers (so the pipeline forwards it to backends as `X-Request-ID`) and
//! into the response headers (so clients can quote it when reporting
//! problems). Incoming values are overwritten: the gateway is the trust
//! boundary, and ids it did not mint cannot be trusted for correlation.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use uuid::Uuid;

/// Header carrying the request id, on both sides of the gateway.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Fallback value if a generated id ever fails header encoding.
static UNKNOWN_REQUEST_ID: HeaderValue = HeaderValue::from_static("unknown");

/// Request ID layer for the Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Service wrapper that stamps ids on requests and responses.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = Uuid::new_v4().to_string();

        let header_value = request_id
            .parse()
            .unwrap_or_else(|_| UNKNOWN_REQUEST_ID.clone());
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
            Ok(response)
        })
    }
}

/// Read the stamped id back out of a request.
pub fn request_id<B>(req: &Request<B>) -> &str {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}
