//! Core match data types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Stage identity and status
// ============================================================================

/// One of the three sequential processing phases of a match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Upload or remote-link download of the source video.
    Ingestion,
    /// Player detection over the resolved video.
    Detection,
    /// Full video analysis.
    Analysis,
}

impl StageName {
    /// All stages in processing order.
    pub const ALL: [StageName; 3] = [
        StageName::Ingestion,
        StageName::Detection,
        StageName::Analysis,
    ];

    /// Returns the stage name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Ingestion => "ingestion",
            StageName::Detection => "detection",
            StageName::Analysis => "analysis",
        }
    }

    /// Prefix of the lease key guarding this stage (`<prefix>_<match id>`).
    pub fn lease_prefix(&self) -> &'static str {
        match self {
            StageName::Ingestion => "download",
            StageName::Detection => "player",
            StageName::Analysis => "analysis",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single stage.
///
/// ```text
/// NotStarted ──submit──> Processing ──poll──> Completed
///     │                      │
///     └──> Pending ──submit──┘ └──poll/policy──> Failed ──reset──> Processing
/// ```
///
/// `Pending` is only used by analysis: assignments were supplied but the
/// stage has not been submitted yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    NotStarted,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StageStatus {
    /// Returns the status as a string (for filtering and persistence).
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::NotStarted => "not_started",
            StageStatus::Pending => "pending",
            StageStatus::Processing => "processing",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }

    /// Parse a persisted status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(StageStatus::NotStarted),
            "pending" => Some(StageStatus::Pending),
            "processing" => Some(StageStatus::Processing),
            "completed" => Some(StageStatus::Completed),
            "failed" => Some(StageStatus::Failed),
            _ => None,
        }
    }

    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Failures
// ============================================================================

/// Why a stage ended up `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The external service reported the job as failed.
    Remote,
    /// The external service refused the input itself (user error).
    Rejected,
    /// The remote job is unknown or expired.
    NotFound,
    /// Elapsed time exceeded the stage timeout.
    TimedOut,
    /// Retry counter reached the configured maximum.
    RetriesExhausted,
    /// The service reported success without the output the next stage needs.
    MissingOutput,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Remote => "remote",
            FailureKind::Rejected => "rejected",
            FailureKind::NotFound => "not_found",
            FailureKind::TimedOut => "timed_out",
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::MissingOutput => "missing_output",
        }
    }

    /// Whether a read-time visit may reset a stage that failed this way.
    pub fn is_resettable(&self) -> bool {
        !matches!(self, FailureKind::Rejected)
    }
}

/// Last error recorded on a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageFailure {
    pub kind: FailureKind,
    /// Human-readable reason, also sent to the owner.
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            failed_at,
        }
    }
}

// ============================================================================
// Stage records
// ============================================================================

/// Bookkeeping shared by every stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StageProgress {
    #[serde(default)]
    pub status: StageStatus,
    /// Remote job id, once a submission succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Reconciliation passes consumed since the stage (re)started.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StageFailure>,
}

impl StageProgress {
    /// Time since the stage started, if it has a start time.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at.map(|started| now.signed_duration_since(started))
    }

    pub fn is_processing(&self) -> bool {
        self.status == StageStatus::Processing
    }
}

/// Where the source video comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceRef {
    /// File uploaded by the user to object storage.
    Upload { object_key: String },
    /// Remote link the ingestion service must download.
    Link { url: String },
}

impl SourceRef {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            SourceRef::Upload { object_key } => format!("upload:{}", object_key),
            SourceRef::Link { url } => format!("link:{}", url),
        }
    }
}

/// Ingestion stage record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IngestionStage {
    #[serde(flatten)]
    pub progress: StageProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
    /// Resolved source video location, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_location: Option<String>,
}

/// A player found by the detection service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedPlayer {
    pub player_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Player detection stage record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DetectionStage {
    #[serde(flatten)]
    pub progress: StageProgress,
    #[serde(default)]
    pub players: Vec<DetectedPlayer>,
}

/// User-confirmed mapping of a detected player to a team.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerAssignment {
    pub player_id: String,
    pub team: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jersey_number: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Analysis stage record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AnalysisStage {
    #[serde(flatten)]
    pub progress: StageProgress,
    /// Player/team assignments supplied by the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignments: Option<Vec<PlayerAssignment>>,
    /// Reference to the analysis artifact, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
}

impl AnalysisStage {
    /// Returns true if a non-empty assignment list was supplied.
    pub fn has_assignments(&self) -> bool {
        self.assignments.as_ref().is_some_and(|a| !a.is_empty())
    }
}

// ============================================================================
// Match
// ============================================================================

/// A submitted match video and its progress through the three stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Match {
    /// Unique identifier (UUID).
    pub id: String,
    /// User who submitted the match; receives notifications.
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub ingestion: IngestionStage,
    pub detection: DetectionStage,
    pub analysis: AnalysisStage,
    pub updated_at: DateTime<Utc>,
}

impl Match {
    /// Bookkeeping of the given stage.
    pub fn progress(&self, stage: StageName) -> &StageProgress {
        match stage {
            StageName::Ingestion => &self.ingestion.progress,
            StageName::Detection => &self.detection.progress,
            StageName::Analysis => &self.analysis.progress,
        }
    }

    /// Mutable bookkeeping of the given stage.
    pub fn progress_mut(&mut self, stage: StageName) -> &mut StageProgress {
        match stage {
            StageName::Ingestion => &mut self.ingestion.progress,
            StageName::Detection => &mut self.detection.progress,
            StageName::Analysis => &mut self.analysis.progress,
        }
    }

    /// Resolved video location, only once ingestion completed.
    pub fn video_location(&self) -> Option<&str> {
        if self.ingestion.progress.status != StageStatus::Completed {
            return None;
        }
        self.ingestion
            .video_location
            .as_deref()
            .filter(|loc| !loc.is_empty())
    }

    /// Whether everything the stage needs to be submitted is present.
    pub fn stage_input_available(&self, stage: StageName) -> bool {
        match stage {
            StageName::Ingestion => self.ingestion.source.is_some(),
            StageName::Detection => self.video_location().is_some(),
            StageName::Analysis => {
                self.video_location().is_some()
                    && self.detection.progress.status == StageStatus::Completed
                    && self.analysis.has_assignments()
            }
        }
    }

    /// Lease key guarding the given stage of this match.
    pub fn lease_key(&self, stage: StageName) -> String {
        lease_key(stage, &self.id)
    }
}

/// Lease key for `stage` of the match `match_id`, e.g. `player_<id>`.
pub fn lease_key(stage: StageName, match_id: &str) -> String {
    format!("{}_{}", stage.lease_prefix(), match_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_match() -> Match {
        let now = Utc::now();
        Match {
            id: "m-1".to_string(),
            owner_id: "owner-1".to_string(),
            created_at: now,
            ingestion: IngestionStage::default(),
            detection: DetectionStage::default(),
            analysis: AnalysisStage::default(),
            updated_at: now,
        }
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            StageStatus::NotStarted,
            StageStatus::Pending,
            StageStatus::Processing,
            StageStatus::Completed,
            StageStatus::Failed,
        ] {
            assert_eq!(StageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StageStatus::parse("in_progress"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(!StageStatus::Processing.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
    }

    #[test]
    fn test_only_rejected_failures_are_not_resettable() {
        assert!(!FailureKind::Rejected.is_resettable());
        assert!(FailureKind::RetriesExhausted.is_resettable());
        assert!(FailureKind::TimedOut.is_resettable());
        assert!(FailureKind::NotFound.is_resettable());
        assert!(FailureKind::Remote.is_resettable());
    }

    #[test]
    fn test_lease_keys_use_stage_prefix() {
        assert_eq!(lease_key(StageName::Ingestion, "abc"), "download_abc");
        assert_eq!(lease_key(StageName::Detection, "abc"), "player_abc");
        assert_eq!(lease_key(StageName::Analysis, "abc"), "analysis_abc");
    }

    #[test]
    fn test_video_location_requires_completed_ingestion() {
        let mut m = empty_match();
        m.ingestion.video_location = Some("s3://bucket/video.mp4".to_string());
        m.ingestion.progress.status = StageStatus::Processing;
        assert!(m.video_location().is_none());
        assert!(!m.stage_input_available(StageName::Detection));

        m.ingestion.progress.status = StageStatus::Completed;
        assert_eq!(m.video_location(), Some("s3://bucket/video.mp4"));
        assert!(m.stage_input_available(StageName::Detection));
    }

    #[test]
    fn test_empty_location_is_not_an_input() {
        let mut m = empty_match();
        m.ingestion.progress.status = StageStatus::Completed;
        m.ingestion.video_location = Some(String::new());
        assert!(m.video_location().is_none());
    }

    #[test]
    fn test_analysis_input_needs_detection_and_assignments() {
        let mut m = empty_match();
        m.ingestion.progress.status = StageStatus::Completed;
        m.ingestion.video_location = Some("s3://v.mp4".to_string());
        assert!(!m.stage_input_available(StageName::Analysis));

        m.detection.progress.status = StageStatus::Completed;
        assert!(!m.stage_input_available(StageName::Analysis));

        m.analysis.assignments = Some(vec![]);
        assert!(!m.stage_input_available(StageName::Analysis));

        m.analysis.assignments = Some(vec![PlayerAssignment {
            player_id: "p1".to_string(),
            team: "home".to_string(),
            jersey_number: Some(10),
            name: None,
        }]);
        assert!(m.stage_input_available(StageName::Analysis));
    }

    #[test]
    fn test_stage_serialization_is_flat() {
        let stage = IngestionStage {
            progress: StageProgress {
                status: StageStatus::Processing,
                job_id: Some("job-1".to_string()),
                retry_count: 3,
                ..Default::default()
            },
            source: Some(SourceRef::Link {
                url: "https://example.com/match.mp4".to_string(),
            }),
            video_location: None,
        };

        let json = serde_json::to_value(&stage).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["job_id"], "job-1");
        assert_eq!(json["retry_count"], 3);
        assert_eq!(json["source"]["type"], "link");

        let parsed: IngestionStage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, stage);
    }

    #[test]
    fn test_elapsed_without_start_is_none() {
        let progress = StageProgress::default();
        assert!(progress.elapsed(Utc::now()).is_none());
    }
}
