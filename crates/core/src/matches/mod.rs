//! Matches: the unit of work driven through ingestion, detection and analysis.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteMatchStore;
pub use store::{CreateMatchRequest, MatchError, MatchFilter, MatchStore};
pub use types::{
    lease_key, AnalysisStage, DetectedPlayer, DetectionStage, FailureKind, IngestionStage, Match,
    PlayerAssignment, SourceRef, StageFailure, StageName, StageProgress, StageStatus,
};
