//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the matchflow server:
//! - HTTP request metrics (latency, counts, errors)
//! - Match counts by stage and status (collected dynamically)
//! - Reconciler state (collected dynamically)

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use matchflow_core::{MatchFilter, MatchStore, StageName, StageStatus};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "matchflow_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("matchflow_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "matchflow_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Match Metrics (collected dynamically)
// =============================================================================

/// Matches by stage and current stage status.
pub static MATCHES_BY_STAGE_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "matchflow_matches_by_stage_status",
            "Current match count by stage and stage status",
        ),
        &["stage", "status"],
    )
    .unwrap()
});

// =============================================================================
// Reconciler Metrics (collected dynamically)
// =============================================================================

/// Reconciler running state (1 = running, 0 = stopped).
pub static RECONCILER_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "matchflow_reconciler_running",
        "Whether the reconciler loop is running (1) or stopped (0)",
    )
    .unwrap()
});

/// Ticks skipped because the previous one was still running.
pub static RECONCILER_TICKS_SKIPPED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "matchflow_reconciler_ticks_skipped",
        "Ticks skipped since startup because a tick was still running",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Matches
    registry
        .register(Box::new(MATCHES_BY_STAGE_STATUS.clone()))
        .unwrap();

    // Reconciler
    registry
        .register(Box::new(RECONCILER_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(RECONCILER_TICKS_SKIPPED.clone()))
        .unwrap();

    // Core metrics (reconciler, stages, leases, external services)
    for metric in matchflow_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Collect dynamic metrics from current application state.
///
/// Called before encoding so that gauges reflect the stores and the
/// reconciler at scrape time.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    if let Some(reconciler) = state.reconciler() {
        let status = reconciler.status().await;
        RECONCILER_RUNNING.set(if status.running { 1 } else { 0 });
        RECONCILER_TICKS_SKIPPED.set(status.ticks_skipped as i64);
    }

    let matches = state.engine().matches();
    for status in [
        StageStatus::NotStarted,
        StageStatus::Pending,
        StageStatus::Processing,
        StageStatus::Completed,
        StageStatus::Failed,
    ] {
        for stage in StageName::ALL {
            let filter = match stage {
                StageName::Ingestion => MatchFilter::new().with_ingestion_status([status]),
                StageName::Detection => MatchFilter::new().with_detection_status([status]),
                StageName::Analysis => MatchFilter::new().with_analysis_status([status]),
            };
            if let Ok(count) = matches.count(&filter) {
                MATCHES_BY_STAGE_STATUS
                    .with_label_values(&[stage.as_str(), status.as_str()])
                    .set(count);
            }
        }
    }
}

/// Normalize a path for metric labels (replace IDs with placeholders).
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if is_uuid(segment) || is_numeric(segment) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn is_uuid(segment: &str) -> bool {
    let groups: Vec<&str> = segment.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(group, len)| group.len() == len && group.bytes().all(|b| b.is_ascii_hexdigit()))
}
