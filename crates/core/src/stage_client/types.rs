//! Contracts of the external ingestion, detection and analysis services.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matches::{DetectedPlayer, PlayerAssignment, SourceRef};
use crate::stage::PollOutcome;

/// Errors that can occur when talking to a stage service.
#[derive(Debug, Error)]
pub enum StageClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timeout")]
    Timeout,
}

impl StageClientError {
    /// The remote job is unknown or expired. Terminal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StageClientError::NotFound(_))
    }

    /// Anything but not-found may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        !self.is_not_found()
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StageClientError::ConnectionFailed(_) => "connection",
            StageClientError::NotFound(_) => "not_found",
            StageClientError::Rejected(_) => "rejected",
            StageClientError::ApiError { .. } => "api",
            StageClientError::InvalidResponse(_) => "invalid_response",
            StageClientError::Timeout => "timeout",
        }
    }
}

/// A job accepted by a stage service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub job_id: String,
}

impl SubmittedJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
        }
    }
}

/// Upload/remote-link ingestion service.
///
/// A completed job yields the resolved video location.
#[async_trait]
pub trait IngestionClient: Send + Sync {
    /// Service name for logging.
    fn name(&self) -> &str;

    async fn submit(
        &self,
        match_id: &str,
        source: &SourceRef,
    ) -> Result<SubmittedJob, StageClientError>;

    async fn poll(&self, job_id: &str) -> Result<PollOutcome<String>, StageClientError>;
}

/// Player detection service.
#[async_trait]
pub trait DetectionClient: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(
        &self,
        match_id: &str,
        video_location: &str,
    ) -> Result<SubmittedJob, StageClientError>;

    async fn poll(
        &self,
        job_id: &str,
    ) -> Result<PollOutcome<Vec<DetectedPlayer>>, StageClientError>;
}

/// Full video analysis service.
///
/// A completed job yields a reference to the analysis artifact.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(
        &self,
        match_id: &str,
        video_location: &str,
        assignments: &[PlayerAssignment],
    ) -> Result<SubmittedJob, StageClientError>;

    async fn poll(&self, job_id: &str) -> Result<PollOutcome<String>, StageClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_not_found_is_terminal() {
        assert!(StageClientError::NotFound("job-1".into()).is_not_found());
        assert!(!StageClientError::NotFound("job-1".into()).is_transient());

        let transient = [
            StageClientError::ConnectionFailed("refused".into()),
            StageClientError::Rejected("bad input".into()),
            StageClientError::ApiError {
                status: 503,
                message: "unavailable".into(),
            },
            StageClientError::InvalidResponse("not json".into()),
            StageClientError::Timeout,
        ];
        for err in transient {
            assert!(err.is_transient(), "{} should be transient", err);
        }
    }

    #[test]
    fn test_error_display() {
        let err = StageClientError::ApiError {
            status: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "API error (502): bad gateway");
    }
}
