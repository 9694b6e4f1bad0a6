//! HTTP middleware applied around the gateway pipeline.
//!
//! Only one concern lives at this layer: request-id stamping, which must run
//! before everything else so that every log line and every response — even a
//! rejection from the first pipeline stage — carries a correlation id.
//! The remaining cross-cutting checks are pipeline stages with a contractual
//! order, not composable middleware; they live in `crate::pipeline`.

pub mod request_id;

pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer, request_id};
