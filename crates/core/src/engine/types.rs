use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::matches::{DetectedPlayer, FailureKind, Match, StageName, StageStatus};
use crate::stage::{Correction, StageOutput};
use crate::stage_client::{AnalysisClient, DetectionClient, IngestionClient};

/// Output of a completed stage, as folded into the match.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    /// Resolved source video location (ingestion).
    VideoLocation(String),
    /// Detected players (detection).
    Players(Vec<DetectedPlayer>),
    /// Analysis artifact reference (analysis).
    Artifact(String),
}

impl StageOutput for StageResult {
    fn is_present(&self) -> bool {
        match self {
            StageResult::VideoLocation(location) => location.is_present(),
            StageResult::Players(players) => players.is_present(),
            StageResult::Artifact(artifact) => artifact.is_present(),
        }
    }
}

impl StageResult {
    /// Store the output on the matching stage record.
    pub fn store_on(self, m: &mut Match) {
        match self {
            StageResult::VideoLocation(location) => m.ingestion.video_location = Some(location),
            StageResult::Players(players) => m.detection.players = players,
            StageResult::Artifact(artifact) => m.analysis.artifact_ref = Some(artifact),
        }
    }
}

/// Clients for the external stage services. A missing client disables its stage.
#[derive(Clone, Default)]
pub struct StageServices {
    pub ingestion: Option<Arc<dyn IngestionClient>>,
    pub detection: Option<Arc<dyn DetectionClient>>,
    pub analysis: Option<Arc<dyn AnalysisClient>>,
}

impl StageServices {
    pub fn is_configured(&self, stage: StageName) -> bool {
        match stage {
            StageName::Ingestion => self.ingestion.is_some(),
            StageName::Detection => self.detection.is_some(),
            StageName::Analysis => self.analysis.is_some(),
        }
    }
}

/// What one reconciliation attempt did to a match stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The lease was held elsewhere.
    Locked,
    /// Nothing was due.
    Idle,
    /// The stage was submitted.
    Submitted { job_id: String },
    /// A processing stage without a job id was submitted again.
    Resubmitted { job_id: String },
    /// Still processing remotely.
    StillProcessing,
    Completed,
    Failed { kind: FailureKind },
}

impl ReconcileOutcome {
    /// Whether the stage status or job changed.
    pub fn advanced(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Submitted { .. }
                | ReconcileOutcome::Resubmitted { .. }
                | ReconcileOutcome::Completed
                | ReconcileOutcome::Failed { .. }
        )
    }
}

/// Result of an ingestion webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The status was folded into the match.
    Applied { match_id: String, status: StageStatus },
    /// The stage was already terminal. Nothing changed.
    Duplicate { match_id: String },
    /// The lease was held; polling will pick the result up.
    Deferred { match_id: String },
    /// The webhook refers to a job the match no longer tracks.
    Stale { match_id: String },
    /// No match knows this job.
    UnknownJob { job_id: String },
}

/// A read-time correction applied to one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedCorrection {
    pub stage: StageName,
    pub correction: Correction,
}
