//! Pure stage transitions.
//!
//! Nothing here touches the network or a store: every function takes the
//! current [`StageProgress`] and returns the next one.

use chrono::{DateTime, Utc};

use crate::matches::{DetectedPlayer, FailureKind, StageFailure, StageProgress, StageStatus};

use super::policy::RetryPolicy;

/// Normalised result of polling (or being told about) a remote job.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    /// Still queued or running.
    Processing,
    /// Finished successfully with the stage output.
    Completed(T),
    /// The service reported the job as failed.
    Failed(String),
    /// The service refused the input itself.
    Rejected(String),
    /// The remote job is unknown or expired.
    NotFound,
}

impl<T> PollOutcome<T> {
    pub fn label(&self) -> &'static str {
        match self {
            PollOutcome::Processing => "processing",
            PollOutcome::Completed(_) => "completed",
            PollOutcome::Failed(_) => "failed",
            PollOutcome::Rejected(_) => "rejected",
            PollOutcome::NotFound => "not_found",
        }
    }

    /// Convert the completed output, keeping every other outcome.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PollOutcome<U> {
        match self {
            PollOutcome::Processing => PollOutcome::Processing,
            PollOutcome::Completed(output) => PollOutcome::Completed(f(output)),
            PollOutcome::Failed(reason) => PollOutcome::Failed(reason),
            PollOutcome::Rejected(reason) => PollOutcome::Rejected(reason),
            PollOutcome::NotFound => PollOutcome::NotFound,
        }
    }
}

/// Output a stage must produce for the next stage to start.
pub trait StageOutput {
    /// Returns false if the service reported success without usable output.
    fn is_present(&self) -> bool;
}

/// Resolved location or artifact reference.
impl StageOutput for String {
    fn is_present(&self) -> bool {
        !self.trim().is_empty()
    }
}

/// An empty detection list is still a valid result.
impl StageOutput for Vec<DetectedPlayer> {
    fn is_present(&self) -> bool {
        true
    }
}

/// Side effect the caller must apply after a poll transition.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEffect<T> {
    /// Nothing changed.
    Unchanged,
    /// Store the output on the stage record.
    Completed(T),
    /// The stage failed; tell the owner.
    Failed(StageFailure),
}

/// New progress plus what happened.
#[derive(Debug, Clone, PartialEq)]
pub struct PollTransition<T> {
    pub progress: StageProgress,
    pub effect: PollEffect<T>,
}

/// Fold a poll outcome into the stage progress.
///
/// Polling a terminal stage is a no-op.
pub fn apply_poll<T: StageOutput>(
    progress: &StageProgress,
    outcome: PollOutcome<T>,
    now: DateTime<Utc>,
) -> PollTransition<T> {
    if progress.status.is_terminal() {
        return unchanged(progress);
    }

    match outcome {
        PollOutcome::Processing => unchanged(progress),
        PollOutcome::Completed(output) if output.is_present() => {
            let mut next = progress.clone();
            next.status = StageStatus::Completed;
            next.retry_count = 0;
            next.completed_at = Some(now);
            next.last_error = None;
            PollTransition {
                progress: next,
                effect: PollEffect::Completed(output),
            }
        }
        PollOutcome::Completed(_) => failed(
            progress,
            StageFailure::new(
                FailureKind::MissingOutput,
                "Service reported success without producing an output",
                now,
            ),
        ),
        PollOutcome::Failed(reason) => failed(
            progress,
            StageFailure::new(FailureKind::Remote, reason, now),
        ),
        PollOutcome::Rejected(reason) => failed(
            progress,
            StageFailure::new(FailureKind::Rejected, reason, now),
        ),
        PollOutcome::NotFound => failed(
            progress,
            StageFailure::new(
                FailureKind::NotFound,
                "Remote job not found or expired",
                now,
            ),
        ),
    }
}

fn unchanged<T>(progress: &StageProgress) -> PollTransition<T> {
    PollTransition {
        progress: progress.clone(),
        effect: PollEffect::Unchanged,
    }
}

fn failed<T>(progress: &StageProgress, failure: StageFailure) -> PollTransition<T> {
    PollTransition {
        progress: apply_failure(progress, failure.clone()),
        effect: PollEffect::Failed(failure),
    }
}

/// Record a successful submission.
pub fn apply_submission(job_id: impl Into<String>, now: DateTime<Utc>) -> StageProgress {
    StageProgress {
        status: StageStatus::Processing,
        job_id: Some(job_id.into()),
        retry_count: 0,
        started_at: Some(now),
        completed_at: None,
        last_error: None,
    }
}

/// Force the stage to `failed`.
pub fn apply_failure(progress: &StageProgress, failure: StageFailure) -> StageProgress {
    let mut next = progress.clone();
    next.status = StageStatus::Failed;
    next.last_error = Some(failure);
    next
}

/// Consume one retry.
pub fn consume_retry(progress: &StageProgress) -> StageProgress {
    let mut next = progress.clone();
    next.retry_count = next.retry_count.saturating_add(1);
    next
}

/// Resubmission of a `processing` stage that had no job id.
///
/// Unlike a first submission the start time and retry counter are kept, so
/// the timeout and retry budget still bound the stage.
pub fn apply_resubmission(progress: &StageProgress, job_id: impl Into<String>) -> StageProgress {
    let mut next = progress.clone();
    next.job_id = Some(job_id.into());
    next
}

/// Correction applied when a match is viewed outside the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// A `processing` stage got its retry budget and start time back.
    RetryBudgetRestored,
    /// A resettable `failed` stage went back to `processing`.
    FailedStageReset,
}

impl Correction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Correction::RetryBudgetRestored => "retry_budget_restored",
            Correction::FailedStageReset => "failed_stage_reset",
        }
    }
}

/// Read-time correction for one stage, if any applies.
///
/// `input_available` tells whether the stage could still be submitted.
pub fn read_time_correction(
    progress: &StageProgress,
    policy: &RetryPolicy,
    input_available: bool,
    now: DateTime<Utc>,
) -> Option<(StageProgress, Correction)> {
    match progress.status {
        StageStatus::Processing if policy.is_exhausted(progress) => {
            let mut next = progress.clone();
            next.retry_count = 0;
            next.started_at = Some(now);
            Some((next, Correction::RetryBudgetRestored))
        }
        StageStatus::Failed => {
            let resettable = progress
                .last_error
                .as_ref()
                .map(|e| e.kind.is_resettable())
                .unwrap_or(true);
            if !resettable || !input_available {
                return None;
            }
            // No job id: the next pass submits a fresh job.
            let next = StageProgress {
                status: StageStatus::Processing,
                job_id: None,
                retry_count: 0,
                started_at: Some(now),
                completed_at: None,
                last_error: None,
            };
            Some((next, Correction::FailedStageReset))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn processing(retry_count: u32) -> StageProgress {
        StageProgress {
            status: StageStatus::Processing,
            job_id: Some("job-1".to_string()),
            retry_count,
            started_at: Some(Utc::now() - chrono::Duration::minutes(10)),
            ..Default::default()
        }
    }

    fn failed_with(kind: FailureKind) -> StageProgress {
        apply_failure(
            &processing(4),
            StageFailure::new(kind, "boom", Utc::now()),
        )
    }

    #[test]
    fn test_processing_outcome_is_noop() {
        let progress = processing(3);
        let t = apply_poll::<String>(&progress, PollOutcome::Processing, Utc::now());
        assert_eq!(t.progress, progress);
        assert_eq!(t.effect, PollEffect::Unchanged);
    }

    #[test]
    fn test_completed_clears_retries_and_records_time() {
        let now = Utc::now();
        let t = apply_poll(
            &processing(7),
            PollOutcome::Completed("s3://bucket/v.mp4".to_string()),
            now,
        );
        assert_eq!(t.progress.status, StageStatus::Completed);
        assert_eq!(t.progress.retry_count, 0);
        assert_eq!(t.progress.completed_at, Some(now));
        assert_eq!(t.progress.job_id.as_deref(), Some("job-1"));
        assert_eq!(
            t.effect,
            PollEffect::Completed("s3://bucket/v.mp4".to_string())
        );
    }

    #[test]
    fn test_completed_without_output_fails() {
        let t = apply_poll(
            &processing(1),
            PollOutcome::Completed("  ".to_string()),
            Utc::now(),
        );
        assert_eq!(t.progress.status, StageStatus::Failed);
        let err = t.progress.last_error.unwrap();
        assert_eq!(err.kind, FailureKind::MissingOutput);
    }

    #[test]
    fn test_empty_detection_list_completes() {
        let t = apply_poll(
            &processing(1),
            PollOutcome::Completed(Vec::<DetectedPlayer>::new()),
            Utc::now(),
        );
        assert_eq!(t.progress.status, StageStatus::Completed);
    }

    #[test]
    fn test_not_found_fails_with_zero_retries() {
        let t = apply_poll::<String>(&processing(0), PollOutcome::NotFound, Utc::now());
        assert_eq!(t.progress.status, StageStatus::Failed);
        match t.effect {
            PollEffect::Failed(failure) => assert_eq!(failure.kind, FailureKind::NotFound),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_remote_failure_and_rejection_are_distinct() {
        let remote = apply_poll::<String>(
            &processing(0),
            PollOutcome::Failed("decoder crashed".to_string()),
            Utc::now(),
        );
        let rejected = apply_poll::<String>(
            &processing(0),
            PollOutcome::Rejected("unsupported codec".to_string()),
            Utc::now(),
        );
        assert_eq!(
            remote.progress.last_error.unwrap().kind,
            FailureKind::Remote
        );
        let rejected_err = rejected.progress.last_error.unwrap();
        assert_eq!(rejected_err.kind, FailureKind::Rejected);
        assert_eq!(rejected_err.message, "unsupported codec");
    }

    #[test]
    fn test_poll_on_terminal_stage_is_noop() {
        let done = apply_poll(
            &processing(2),
            PollOutcome::Completed("loc".to_string()),
            Utc::now(),
        )
        .progress;

        let again = apply_poll::<String>(&done, PollOutcome::NotFound, Utc::now());
        assert_eq!(again.progress, done);
        assert_eq!(again.effect, PollEffect::Unchanged);

        let failed = failed_with(FailureKind::Remote);
        let again = apply_poll(&failed, PollOutcome::Completed("loc".to_string()), Utc::now());
        assert_eq!(again.progress, failed);
    }

    #[test]
    fn test_submission_resets_bookkeeping() {
        let now = Utc::now();
        let next = apply_submission("job-2", now);
        assert_eq!(next.status, StageStatus::Processing);
        assert_eq!(next.job_id.as_deref(), Some("job-2"));
        assert_eq!(next.retry_count, 0);
        assert_eq!(next.started_at, Some(now));
        assert!(next.last_error.is_none());
    }

    #[test]
    fn test_resubmission_keeps_budget() {
        let mut progress = processing(5);
        progress.job_id = None;
        let next = apply_resubmission(&progress, "job-3");
        assert_eq!(next.retry_count, 5);
        assert_eq!(next.started_at, progress.started_at);
        assert_eq!(next.job_id.as_deref(), Some("job-3"));
    }

    #[test]
    fn test_consume_retry_increments() {
        assert_eq!(consume_retry(&processing(3)).retry_count, 4);
    }

    #[test]
    fn test_read_time_restores_exhausted_budget() {
        let policy = RetryPolicy::new(Duration::from_secs(7200), 10);
        let now = Utc::now();
        let (next, correction) =
            read_time_correction(&processing(10), &policy, true, now).unwrap();
        assert_eq!(correction, Correction::RetryBudgetRestored);
        assert_eq!(next.status, StageStatus::Processing);
        assert_eq!(next.retry_count, 0);
        assert_eq!(next.started_at, Some(now));
        assert_eq!(next.job_id.as_deref(), Some("job-1"));
    }

    #[test]
    fn test_read_time_leaves_healthy_processing_alone() {
        let policy = RetryPolicy::new(Duration::from_secs(7200), 10);
        assert!(read_time_correction(&processing(3), &policy, true, Utc::now()).is_none());
    }

    #[test]
    fn test_read_time_resets_resettable_failure() {
        let policy = RetryPolicy::new(Duration::from_secs(7200), 10);
        let now = Utc::now();
        let (next, correction) = read_time_correction(
            &failed_with(FailureKind::RetriesExhausted),
            &policy,
            true,
            now,
        )
        .unwrap();
        assert_eq!(correction, Correction::FailedStageReset);
        assert_eq!(next.status, StageStatus::Processing);
        assert_eq!(next.retry_count, 0);
        assert_eq!(next.started_at, Some(now));
        assert!(next.job_id.is_none());
    }

    #[test]
    fn test_read_time_skips_rejected_or_missing_input() {
        let policy = RetryPolicy::new(Duration::from_secs(7200), 10);
        assert!(read_time_correction(
            &failed_with(FailureKind::Rejected),
            &policy,
            true,
            Utc::now()
        )
        .is_none());
        assert!(read_time_correction(
            &failed_with(FailureKind::TimedOut),
            &policy,
            false,
            Utc::now()
        )
        .is_none());
    }

    #[test]
    fn test_read_time_ignores_other_statuses() {
        let policy = RetryPolicy::new(Duration::from_secs(7200), 0);
        for status in [
            StageStatus::NotStarted,
            StageStatus::Pending,
            StageStatus::Completed,
        ] {
            let progress = StageProgress {
                status,
                ..Default::default()
            };
            assert!(read_time_correction(&progress, &policy, true, Utc::now()).is_none());
        }
    }
}
