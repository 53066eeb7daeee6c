//! Types for the match reconciler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matches::{MatchError, StageName};

/// Errors that can occur while reconciling.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// Another tick is still running.
    #[error("a reconciliation tick is already running")]
    TickInProgress,

    /// Selecting the matches of a scan failed.
    #[error("match store error: {0}")]
    Store(#[from] MatchError),
}

/// What one scan of a tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub stage: StageName,
    /// Matches selected by the scan.
    pub examined: usize,
    /// Matches whose stage was submitted, completed or failed.
    pub advanced: usize,
    /// Matches skipped because the stage lease was held.
    pub locked: usize,
    /// Matches whose reconciliation failed. They are retried next tick.
    pub errors: usize,
    /// The scan did not run because the stage service is not configured.
    #[serde(default)]
    pub disabled: bool,
}

impl ScanReport {
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            examined: 0,
            advanced: 0,
            locked: 0,
            errors: 0,
            disabled: false,
        }
    }
}

/// Summary of one reconciliation tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Expired leases removed before scanning.
    pub leases_swept: usize,
    /// One report per stage, in stage order.
    pub scans: Vec<ScanReport>,
}

impl TickReport {
    pub fn scan(&self, stage: StageName) -> Option<&ScanReport> {
        self.scans.iter().find(|s| s.stage == stage)
    }

    pub fn total_errors(&self) -> usize {
        self.scans.iter().map(|s| s.errors).sum()
    }

    pub fn total_advanced(&self) -> usize {
        self.scans.iter().map(|s| s.advanced).sum()
    }
}

/// Current status of the reconciler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcilerStatus {
    /// Whether the periodic loop is running.
    pub running: bool,
    /// Whether a tick is in progress right now.
    pub tick_in_progress: bool,
    pub ticks_completed: u64,
    /// Ticks skipped because the previous one was still running.
    pub ticks_skipped: u64,
    pub last_tick: Option<TickReport>,
    pub ingestion_processing: usize,
    pub detection_processing: usize,
    /// Analyses waiting for detection to complete.
    pub analysis_pending: usize,
    pub analysis_processing: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> TickReport {
        TickReport {
            started_at: Utc::now(),
            duration_ms: 12,
            leases_swept: 1,
            scans: vec![
                ScanReport {
                    examined: 3,
                    advanced: 2,
                    errors: 1,
                    ..ScanReport::new(StageName::Ingestion)
                },
                ScanReport {
                    examined: 2,
                    locked: 1,
                    advanced: 1,
                    ..ScanReport::new(StageName::Detection)
                },
                ScanReport {
                    disabled: true,
                    ..ScanReport::new(StageName::Analysis)
                },
            ],
        }
    }

    #[test]
    fn test_tick_report_totals() {
        let report = report();
        assert_eq!(report.total_errors(), 1);
        assert_eq!(report.total_advanced(), 3);
        assert_eq!(report.scan(StageName::Detection).unwrap().locked, 1);
        assert!(report.scan(StageName::Analysis).unwrap().disabled);
    }

    #[test]
    fn test_status_serialization() {
        let status = ReconcilerStatus {
            running: true,
            ticks_completed: 4,
            last_tick: Some(report()),
            ..Default::default()
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["running"], true);
        assert_eq!(json["ticks_completed"], 4);
        assert_eq!(json["last_tick"]["scans"][0]["stage"], "ingestion");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ReconcilerError::TickInProgress.to_string(),
            "a reconciliation tick is already running"
        );
    }
}
