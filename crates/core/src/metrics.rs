//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Reconciler ticks and per-stage transitions
//! - Lease contention
//! - Calls to the external stage services
//! - Notifications

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciliation ticks by result.
pub static RECONCILER_TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("matchflow_reconciler_ticks_total", "Total reconciliation ticks"),
        &["result"], // "completed", "skipped"
    )
    .unwrap()
});

/// Tick duration in seconds.
pub static RECONCILER_TICK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "matchflow_reconciler_tick_duration_seconds",
            "Duration of one reconciliation tick",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &[],
    )
    .unwrap()
});

/// Per-entity errors caught by the reconciler.
pub static RECONCILE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "matchflow_reconcile_errors_total",
            "Per-match reconciliation errors",
        ),
        &["stage"],
    )
    .unwrap()
});

// =============================================================================
// Stage transitions
// =============================================================================

/// Stage transitions by stage and resulting status.
pub static STAGE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "matchflow_stage_transitions_total",
            "Stage status transitions",
        ),
        &["stage", "to"], // to: "processing", "completed", "failed", "pending"
    )
    .unwrap()
});

/// Stage failures by stage and failure kind.
pub static STAGE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("matchflow_stage_failures_total", "Stage failures by kind"),
        &["stage", "kind"],
    )
    .unwrap()
});

/// Read-time corrections applied.
pub static STAGE_RESETS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "matchflow_stage_resets_total",
            "Read-time stage corrections",
        ),
        &["stage", "correction"], // "retry_budget_restored", "failed_stage_reset"
    )
    .unwrap()
});

// =============================================================================
// Leases
// =============================================================================

/// Lease acquisitions that found the key already held.
pub static LEASE_CONTENDED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "matchflow_lease_contended_total",
            "Lease acquisitions skipped because the key was held",
        ),
        &["stage"],
    )
    .unwrap()
});

/// Expired leases removed by sweeps.
pub static LEASES_SWEPT: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "matchflow_leases_swept_total",
        "Expired leases removed by sweeps",
    )
    .unwrap()
});

// =============================================================================
// External services
// =============================================================================

/// Calls to the stage services by service, operation and outcome.
pub static STAGE_CLIENT_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "matchflow_stage_client_calls_total",
            "Requests to external stage services",
        ),
        &["service", "operation", "outcome"],
    )
    .unwrap()
});

// =============================================================================
// Notifications
// =============================================================================

/// Notifications emitted by event type.
pub static NOTIFICATIONS_EMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "matchflow_notifications_emitted_total",
            "Notifications emitted",
        ),
        &["event_type"],
    )
    .unwrap()
});

/// Notifications dropped because the outbox channel was closed or full.
pub static NOTIFICATIONS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "matchflow_notifications_dropped_total",
        "Notifications that could not be queued",
    )
    .unwrap()
});

/// Returns all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Reconciler
        Box::new(RECONCILER_TICKS.clone()),
        Box::new(RECONCILER_TICK_DURATION.clone()),
        Box::new(RECONCILE_ERRORS.clone()),
        // Stages
        Box::new(STAGE_TRANSITIONS.clone()),
        Box::new(STAGE_FAILURES.clone()),
        Box::new(STAGE_RESETS.clone()),
        // Leases
        Box::new(LEASE_CONTENDED.clone()),
        Box::new(LEASES_SWEPT.clone()),
        // External services
        Box::new(STAGE_CLIENT_CALLS.clone()),
        // Notifications
        Box::new(NOTIFICATIONS_EMITTED.clone()),
        Box::new(NOTIFICATIONS_DROPPED.clone()),
    ]
}
