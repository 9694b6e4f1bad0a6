//! Built-in endpoints served ahead of the gateway pipeline.

pub mod admin;
mod health;
mod metrics;

pub use health::health_check;
pub use metrics::export_metrics;
