//! Match storage trait and types.

use thiserror::Error;

use crate::matches::{
    AnalysisStage, DetectionStage, IngestionStage, Match, SourceRef, StageName, StageStatus,
};

/// Error type for match store operations.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Match not found.
    #[error("Match not found: {0}")]
    NotFound(String),

    /// Stored data could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),
}

/// Request to create a new match.
#[derive(Debug, Clone)]
pub struct CreateMatchRequest {
    /// User submitting the match.
    pub owner_id: String,
    /// Source video, when known at creation (uploads).
    pub source: Option<SourceRef>,
}

/// Filter for querying matches.
///
/// Status lists are OR-ed within a stage and AND-ed across stages; an empty
/// list does not constrain that stage. `due_for` selects the matches a
/// reconciliation pass of that stage could advance, least recently scanned
/// first.
#[derive(Debug, Clone, Default)]
pub struct MatchFilter {
    pub ingestion_status: Vec<StageStatus>,
    pub detection_status: Vec<StageStatus>,
    pub analysis_status: Vec<StageStatus>,
    /// Filter by owner.
    pub owner_id: Option<String>,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
    /// Only matches the stage's reconciliation pass can act on.
    pub due_for: Option<StageName>,
}

impl MatchFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_ingestion_status(mut self, statuses: impl IntoIterator<Item = StageStatus>) -> Self {
        self.ingestion_status = statuses.into_iter().collect();
        self
    }

    pub fn with_detection_status(mut self, statuses: impl IntoIterator<Item = StageStatus>) -> Self {
        self.detection_status = statuses.into_iter().collect();
        self
    }

    pub fn with_analysis_status(mut self, statuses: impl IntoIterator<Item = StageStatus>) -> Self {
        self.analysis_status = statuses.into_iter().collect();
        self
    }

    /// Select matches due for a pass of `stage`, in scan order.
    pub fn with_due(mut self, stage: StageName) -> Self {
        self.due_for = Some(stage);
        self
    }

    /// Filter by owner.
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Set limit.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Set offset.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Trait for match storage backends.
///
/// Stage records are written independently so that work on one stage never
/// overwrites a concurrent write to another stage of the same match.
pub trait MatchStore: Send + Sync {
    /// Create a new match with all stages `not_started`.
    fn create(&self, request: CreateMatchRequest) -> Result<Match, MatchError>;

    /// Get a match by ID.
    fn get(&self, id: &str) -> Result<Option<Match>, MatchError>;

    /// Find the match that was given the ingestion job `job_id`, whether it
    /// is the current job or one the match has since moved past.
    fn find_by_ingestion_job(&self, job_id: &str) -> Result<Option<Match>, MatchError>;

    /// List matches matching the filter, oldest first (scan order for `due_for`).
    fn list(&self, filter: &MatchFilter) -> Result<Vec<Match>, MatchError>;

    /// Record that a pass of `stage` examined these matches, moving them to
    /// the back of the next scan.
    fn mark_scanned(&self, stage: StageName, ids: &[String]) -> Result<(), MatchError>;

    /// Count matches matching the filter.
    fn count(&self, filter: &MatchFilter) -> Result<i64, MatchError>;

    /// Replace the ingestion stage record.
    fn update_ingestion(&self, id: &str, stage: &IngestionStage) -> Result<Match, MatchError>;

    /// Replace the detection stage record.
    fn update_detection(&self, id: &str, stage: &DetectionStage) -> Result<Match, MatchError>;

    /// Replace the analysis stage record.
    fn update_analysis(&self, id: &str, stage: &AnalysisStage) -> Result<Match, MatchError>;
}
