//! A stage engine wired to in-memory stores and mock services.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::engine::{EngineError, StageEngine, StageServices};
use crate::lease::SqliteLeaseStore;
use crate::matches::{
    CreateMatchRequest, DetectedPlayer, Match, MatchStore, SqliteMatchStore, StageName,
    StageStatus,
};
use crate::stage::StagePolicies;
use crate::stage_client::{AnalysisClient, DetectionClient, IngestionClient};

use super::fixtures::upload_source;
use super::{MockAnalysisClient, MockDetectionClient, MockIngestionClient, RecordingNotificationSink};

/// Everything a test needs to drive and inspect a [`StageEngine`].
///
/// # Example
///
/// ```rust,ignore
/// let h = EngineHarness::new()?;
/// let m = h.ingested_match("owner-1", "s3://videos/m.mp4")?;
///
/// h.engine.reconcile(&m.id, StageName::Detection).await?;
/// assert_eq!(h.detection.submission_count().await, 1);
/// ```
pub struct EngineHarness {
    pub engine: Arc<StageEngine>,
    pub matches: Arc<SqliteMatchStore>,
    pub leases: Arc<SqliteLeaseStore>,
    pub ingestion: Arc<MockIngestionClient>,
    pub detection: Arc<MockDetectionClient>,
    pub analysis: Arc<MockAnalysisClient>,
    pub notifications: Arc<RecordingNotificationSink>,
}

impl EngineHarness {
    /// Default policies, all three services configured.
    pub fn new() -> Result<Self, EngineError> {
        Self::builder().build()
    }

    pub fn builder() -> EngineHarnessBuilder {
        EngineHarnessBuilder::default()
    }

    /// Insert a match whose ingestion already completed, without any
    /// submission or notification.
    pub fn ingested_match(&self, owner_id: &str, location: &str) -> Result<Match, EngineError> {
        let created = self.matches.create(CreateMatchRequest {
            owner_id: owner_id.to_string(),
            source: Some(upload_source("uploads/seeded.mp4")),
        })?;

        let mut ingestion = created.ingestion.clone();
        let now = Utc::now();
        ingestion.progress.status = StageStatus::Completed;
        ingestion.progress.job_id = Some(format!("seeded-{}", created.id));
        ingestion.progress.started_at = Some(now);
        ingestion.progress.completed_at = Some(now);
        ingestion.video_location = Some(location.to_string());

        Ok(self.matches.update_ingestion(&created.id, &ingestion)?)
    }

    /// Insert a match whose detection already completed with `players`.
    pub fn detected_match(
        &self,
        owner_id: &str,
        players: Vec<DetectedPlayer>,
    ) -> Result<Match, EngineError> {
        let ingested = self.ingested_match(owner_id, "s3://videos/seeded.mp4")?;

        let mut detection = ingested.detection.clone();
        let now = Utc::now();
        detection.progress.status = StageStatus::Completed;
        detection.progress.job_id = Some(format!("seeded-detection-{}", ingested.id));
        detection.progress.started_at = Some(now);
        detection.progress.completed_at = Some(now);
        detection.players = players;

        Ok(self.matches.update_detection(&ingested.id, &detection)?)
    }

    /// Services as handed to the engine.
    pub fn services(&self) -> &StageServices {
        self.engine.services()
    }
}

/// Builder for [`EngineHarness`].
#[derive(Default)]
pub struct EngineHarnessBuilder {
    policies: Option<StagePolicies>,
    lease_ttl: Option<Duration>,
    without: Vec<StageName>,
}

impl EngineHarnessBuilder {
    pub fn policies(mut self, policies: StagePolicies) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    /// Leave the service of `stage` unconfigured.
    pub fn without(mut self, stage: StageName) -> Self {
        self.without.push(stage);
        self
    }

    pub fn build(self) -> Result<EngineHarness, EngineError> {
        let matches = Arc::new(SqliteMatchStore::in_memory()?);
        let leases = Arc::new(SqliteLeaseStore::in_memory()?);
        let ingestion = Arc::new(MockIngestionClient::default());
        let detection = Arc::new(MockDetectionClient::default());
        let analysis = Arc::new(MockAnalysisClient::default());
        let notifications = Arc::new(RecordingNotificationSink::new());

        let mut services = StageServices {
            ingestion: Some(ingestion.clone() as Arc<dyn IngestionClient>),
            detection: Some(detection.clone() as Arc<dyn DetectionClient>),
            analysis: Some(analysis.clone() as Arc<dyn AnalysisClient>),
        };
        for stage in &self.without {
            match stage {
                StageName::Ingestion => services.ingestion = None,
                StageName::Detection => services.detection = None,
                StageName::Analysis => services.analysis = None,
            }
        }

        let engine = Arc::new(StageEngine::new(
            matches.clone(),
            leases.clone(),
            services,
            self.policies.unwrap_or_default(),
            notifications.clone(),
            self.lease_ttl.unwrap_or(Duration::from_secs(300)),
        ));

        Ok(EngineHarness {
            engine,
            matches,
            leases,
            ingestion,
            detection,
            analysis,
            notifications,
        })
    }
}
