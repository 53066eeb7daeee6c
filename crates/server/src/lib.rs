//! HTTP surface of matchflow: match API, ingestion webhook, reconciler
//! status and Prometheus metrics.

pub mod api;
pub mod metrics;
pub mod state;
