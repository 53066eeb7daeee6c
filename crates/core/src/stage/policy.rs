//! Bounded retries and elapsed-time timeouts shared by every stage.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::matches::{FailureKind, StageName, StageProgress};

/// Limits for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum wall-clock time measured from the stage's recorded start.
    pub timeout: Duration,
    /// Maximum number of reconciliation passes before giving up.
    pub max_retries: u32,
}

/// What a reconciliation pass should do with a `processing` stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Force the stage to `failed`.
    Fail { kind: FailureKind, reason: String },
    /// No remote job id was recorded: submit again, consuming one retry.
    Resubmit,
    /// Consume one retry and poll the remote job.
    Poll,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
        }
    }

    /// Whether the stage has been running longer than the timeout.
    ///
    /// A stage without a start time, or one whose start lies in the future
    /// (clock skew), never times out.
    pub fn is_timed_out(&self, progress: &StageProgress, now: DateTime<Utc>) -> bool {
        progress
            .elapsed(now)
            .and_then(|elapsed| elapsed.to_std().ok())
            .is_some_and(|elapsed| elapsed > self.timeout)
    }

    pub fn is_exhausted(&self, progress: &StageProgress) -> bool {
        progress.retry_count >= self.max_retries
    }

    /// Decide the next step for a stage that is `processing`.
    ///
    /// Timeout wins over retry exhaustion, which wins over everything else.
    pub fn evaluate(&self, progress: &StageProgress, now: DateTime<Utc>) -> PolicyVerdict {
        if self.is_timed_out(progress, now) {
            return PolicyVerdict::Fail {
                kind: FailureKind::TimedOut,
                reason: format!(
                    "Stage did not finish within {}",
                    format_duration(self.timeout)
                ),
            };
        }

        if self.is_exhausted(progress) {
            return PolicyVerdict::Fail {
                kind: FailureKind::RetriesExhausted,
                reason: format!(
                    "Gave up after {} of {} attempts",
                    progress.retry_count, self.max_retries
                ),
            };
        }

        if progress.job_id.is_none() {
            PolicyVerdict::Resubmit
        } else {
            PolicyVerdict::Poll
        }
    }
}

/// Per-stage limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePolicies {
    pub ingestion: RetryPolicy,
    pub detection: RetryPolicy,
    pub analysis: RetryPolicy,
}

impl StagePolicies {
    pub fn for_stage(&self, stage: StageName) -> &RetryPolicy {
        match stage {
            StageName::Ingestion => &self.ingestion,
            StageName::Detection => &self.detection,
            StageName::Analysis => &self.analysis,
        }
    }
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            ingestion: RetryPolicy::new(Duration::from_secs(2 * 3600), 120),
            detection: RetryPolicy::new(Duration::from_secs(2 * 3600), 120),
            analysis: RetryPolicy::new(Duration::from_secs(6 * 3600), 360),
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
