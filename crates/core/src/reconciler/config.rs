//! Reconciler configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the match reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Enable/disable the periodic loop.
    /// When disabled, stages only advance through user actions and webhooks.
    #[serde(default)]
    pub enabled: bool,

    /// Time between ticks (milliseconds).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// How long a stage lease is held before it may be reclaimed (seconds).
    /// Must outlast the slowest single stage call.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Maximum matches examined per stage per tick.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: i64,
}

fn default_tick_interval() -> u64 {
    60_000 // 1 minute
}

fn default_lease_ttl() -> u64 {
    300 // 5 minutes
}

fn default_scan_limit() -> i64 {
    500
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tick_interval_ms: default_tick_interval(),
            lease_ttl_secs: default_lease_ttl(),
            scan_limit: default_scan_limit(),
        }
    }
}

impl ReconcilerConfig {
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lease_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lease_ttl_secs)
    }
}
