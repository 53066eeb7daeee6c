use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::matches::{FailureKind, StageName};

/// Events sent to a match owner on stage transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// A stage was submitted and is now processing.
    StageStarted {
        match_id: String,
        stage: StageName,
        job_id: String,
    },
    /// Assignments were stored; analysis waits for detection.
    StagePending { match_id: String, stage: StageName },
    StageCompleted { match_id: String, stage: StageName },
    /// A stage failed. `reason` is meant for humans.
    StageFailed {
        match_id: String,
        stage: StageName,
        kind: FailureKind,
        reason: String,
    },
    /// A failed stage was put back to processing for another attempt.
    StageReset { match_id: String, stage: StageName },
}

impl NotificationEvent {
    /// Event type string, e.g. `detection_started`.
    pub fn event_type(&self) -> &'static str {
        use NotificationEvent::*;
        use StageName::*;

        match (self, self.stage()) {
            (StageStarted { .. }, Ingestion) => "ingestion_started",
            (StageStarted { .. }, Detection) => "detection_started",
            (StageStarted { .. }, Analysis) => "analysis_started",
            (StagePending { .. }, Ingestion) => "ingestion_pending",
            (StagePending { .. }, Detection) => "detection_pending",
            (StagePending { .. }, Analysis) => "analysis_pending",
            (StageCompleted { .. }, Ingestion) => "ingestion_completed",
            (StageCompleted { .. }, Detection) => "detection_completed",
            (StageCompleted { .. }, Analysis) => "analysis_completed",
            (StageFailed { .. }, Ingestion) => "ingestion_failed",
            (StageFailed { .. }, Detection) => "detection_failed",
            (StageFailed { .. }, Analysis) => "analysis_failed",
            (StageReset { .. }, Ingestion) => "ingestion_reset",
            (StageReset { .. }, Detection) => "detection_reset",
            (StageReset { .. }, Analysis) => "analysis_reset",
        }
    }

    pub fn match_id(&self) -> &str {
        match self {
            NotificationEvent::StageStarted { match_id, .. }
            | NotificationEvent::StagePending { match_id, .. }
            | NotificationEvent::StageCompleted { match_id, .. }
            | NotificationEvent::StageFailed { match_id, .. }
            | NotificationEvent::StageReset { match_id, .. } => match_id,
        }
    }

    pub fn stage(&self) -> StageName {
        match self {
            NotificationEvent::StageStarted { stage, .. }
            | NotificationEvent::StagePending { stage, .. }
            | NotificationEvent::StageCompleted { stage, .. }
            | NotificationEvent::StageFailed { stage, .. }
            | NotificationEvent::StageReset { stage, .. } => *stage,
        }
    }
}

/// A persisted notification (outbox row)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub owner_id: String,
    pub event_type: String,
    pub match_id: String,
    pub data: NotificationEvent,
}
