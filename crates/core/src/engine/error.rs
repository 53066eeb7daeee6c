use thiserror::Error;

use crate::lease::LeaseError;
use crate::matches::{MatchError, StageName, StageStatus};
use crate::stage_client::StageClientError;

/// Errors that can occur while driving a match through its stages.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Match not found.
    #[error("match not found: {0}")]
    MatchNotFound(String),

    /// Another worker holds the lease for this match and stage.
    #[error("{stage} of match {match_id} is being processed elsewhere")]
    Busy { stage: StageName, match_id: String },

    /// The stage's inputs are not available yet.
    #[error("{stage} cannot be submitted: {reason}")]
    MissingInput { stage: StageName, reason: String },

    /// Invalid stage state for operation.
    #[error("invalid {stage} state: expected {expected}, got {actual}")]
    InvalidState {
        stage: StageName,
        expected: String,
        actual: StageStatus,
    },

    /// No client is configured for the stage's service.
    #[error("{0} service is not configured")]
    ServiceUnavailable(StageName),

    /// The service refused or failed a submission. Nothing was recorded.
    #[error("{stage} submission failed: {source}")]
    Submission {
        stage: StageName,
        source: StageClientError,
    },

    /// A transient poll failure. The retry it consumed stays consumed.
    #[error("{stage} poll failed: {source}")]
    Poll {
        stage: StageName,
        source: StageClientError,
    },

    /// Malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("match store error: {0}")]
    Store(#[from] MatchError),

    #[error("lease store error: {0}")]
    Lease(#[from] LeaseError),
}

impl EngineError {
    /// Errors caused by the caller rather than by the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::MissingInput { .. }
                | EngineError::InvalidState { .. }
                | EngineError::InvalidRequest(_)
        )
    }
}
