//! Wire payloads of the stage services.
//!
//! The services have renamed fields across versions (`jobId`, `job_id`,
//! `id`; `video_url`, `location`, ...). Everything is folded here into
//! [`PollOutcome`] so the state machine only ever sees one shape.

use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::matches::DetectedPlayer;
use crate::stage::PollOutcome;

/// Response to a job submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    #[serde(
        alias = "jobId",
        alias = "id",
        alias = "task_id",
        alias = "taskId",
        deserialize_with = "string_or_number"
    )]
    pub job_id: String,
}

/// Job status, as returned by `GET /jobs/{id}` or pushed by a webhook.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobStatusPayload {
    #[serde(
        default,
        alias = "jobId",
        alias = "id",
        alias = "task_id",
        alias = "taskId",
        deserialize_with = "opt_string_or_number"
    )]
    pub job_id: Option<String>,

    #[serde(default, alias = "state", alias = "job_status", alias = "jobStatus")]
    pub status: String,

    /// Resolved source video (ingestion).
    #[serde(
        default,
        alias = "video_url",
        alias = "videoUrl",
        alias = "resolved_location",
        alias = "resolvedLocation",
        alias = "output_url",
        alias = "outputUrl"
    )]
    pub location: Option<String>,

    /// Detected players (detection).
    #[serde(default, alias = "players", alias = "detected_players", alias = "detectedPlayers")]
    pub detections: Option<Vec<DetectionPayload>>,

    /// Analysis artifact reference (analysis).
    #[serde(
        default,
        alias = "artifactRef",
        alias = "artifact_url",
        alias = "artifactUrl",
        alias = "result_url",
        alias = "resultUrl"
    )]
    pub artifact_ref: Option<String>,

    #[serde(
        default,
        alias = "message",
        alias = "error_message",
        alias = "errorMessage",
        alias = "reason"
    )]
    pub error: Option<String>,
}

/// One detected player on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionPayload {
    #[serde(
        alias = "id",
        alias = "playerId",
        alias = "track_id",
        alias = "trackId",
        deserialize_with = "string_or_number"
    )]
    pub player_id: String,
    #[serde(default, alias = "name", alias = "jersey")]
    pub label: Option<String>,
    #[serde(default, alias = "score")]
    pub confidence: Option<f32>,
}

impl From<DetectionPayload> for DetectedPlayer {
    fn from(p: DetectionPayload) -> Self {
        DetectedPlayer {
            player_id: p.player_id,
            label: p.label,
            confidence: p.confidence,
        }
    }
}

/// Remote job status after synonym folding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Processing,
    Completed,
    Failed,
    Rejected,
    NotFound,
    Unknown,
}

/// Fold the status vocabularies of every service version.
pub fn normalize_status(raw: &str) -> RemoteStatus {
    let lowered = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    match lowered.as_str() {
        "pending" | "queued" | "submitted" | "accepted" | "created" | "started" | "running"
        | "processing" | "in_progress" | "inprogress" | "downloading" | "uploading" => {
            RemoteStatus::Processing
        }
        "completed" | "complete" | "done" | "finished" | "success" | "succeeded" | "ready" => {
            RemoteStatus::Completed
        }
        "failed" | "failure" | "error" | "errored" | "cancelled" | "canceled" | "aborted" => {
            RemoteStatus::Failed
        }
        "rejected" | "invalid" | "unsupported" => RemoteStatus::Rejected,
        "not_found" | "notfound" | "expired" | "unknown_job" => RemoteStatus::NotFound,
        _ => RemoteStatus::Unknown,
    }
}

impl JobStatusPayload {
    fn error_or(&self, fallback: &str) -> String {
        self.error
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }

    /// Map the non-completed statuses, leaving completion to the caller.
    fn outcome_with<T>(&self, service: &str, on_completed: impl FnOnce() -> T) -> PollOutcome<T> {
        match normalize_status(&self.status) {
            RemoteStatus::Processing => PollOutcome::Processing,
            RemoteStatus::Completed => PollOutcome::Completed(on_completed()),
            RemoteStatus::Failed => PollOutcome::Failed(self.error_or("Job failed")),
            RemoteStatus::Rejected => PollOutcome::Rejected(self.error_or("Input rejected")),
            RemoteStatus::NotFound => PollOutcome::NotFound,
            RemoteStatus::Unknown => {
                // Bounded by the retry policy, so waiting is safe.
                warn!(
                    service = %service,
                    status = %self.status,
                    "Unrecognised job status, treating as processing"
                );
                PollOutcome::Processing
            }
        }
    }

    /// Ingestion result: the resolved location (empty if missing).
    pub fn into_ingestion_outcome(self) -> PollOutcome<String> {
        let location = self.location.clone().unwrap_or_default();
        self.outcome_with("ingestion", || location)
    }

    /// Detection result. A completed job without a list detected nobody.
    pub fn into_detection_outcome(self) -> PollOutcome<Vec<DetectedPlayer>> {
        let players: Vec<DetectedPlayer> = self
            .detections
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(DetectedPlayer::from)
            .collect();
        self.outcome_with("detection", || players)
    }

    /// Analysis result: the artifact reference (empty if missing).
    pub fn into_analysis_outcome(self) -> PollOutcome<String> {
        let artifact = self.artifact_ref.clone().unwrap_or_default();
        self.outcome_with("analysis", || artifact)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Int(i64),
    Uint(u64),
}

impl From<StringOrNumber> for String {
    fn from(v: StringOrNumber) -> Self {
        match v {
            StringOrNumber::String(s) => s,
            StringOrNumber::Int(i) => i.to_string(),
            StringOrNumber::Uint(u) => u.to_string(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrNumber::deserialize(deserializer).map(String::from)
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<StringOrNumber>::deserialize(deserializer).map(|v| v.map(String::from))
}
