//! Mock stage service clients for testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::matches::{DetectedPlayer, PlayerAssignment, SourceRef};
use crate::stage::PollOutcome;
use crate::stage_client::{
    AnalysisClient, DetectionClient, IngestionClient, StageClientError, SubmittedJob,
};

/// A recorded submission for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedSubmission<I> {
    pub match_id: String,
    /// Job id handed back to the caller.
    pub job_id: String,
    /// What the stage was submitted with.
    pub input: I,
    pub timestamp: DateTime<Utc>,
}

/// Input recorded for an analysis submission.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisInput {
    pub video_location: String,
    pub assignments: Vec<PlayerAssignment>,
}

/// Mock implementation of a stage service.
///
/// Provides controllable behavior for testing:
/// - Track submissions and polls for assertions
/// - Control what each job reports when polled
/// - Simulate failures and slow responses
///
/// Job ids are `<name>-job-<n>`, counting from 1.
///
/// # Example
///
/// ```rust,ignore
/// let detection = MockDetectionClient::default();
///
/// let job = detection.submit("m-1", "s3://videos/m-1.mp4").await?;
/// assert_eq!(job.job_id, "detection-job-1");
///
/// detection
///     .set_poll_outcome("detection-job-1", PollOutcome::Completed(vec![]))
///     .await;
/// ```
#[derive(Debug)]
pub struct MockStageService<I, T> {
    name: String,
    submitted: Arc<RwLock<Vec<RecordedSubmission<I>>>>,
    /// Outcome per job id.
    outcomes: Arc<RwLock<HashMap<String, PollOutcome<T>>>>,
    /// Outcome for jobs without an explicit one.
    default_outcome: Arc<RwLock<PollOutcome<T>>>,
    next_submit_error: Arc<RwLock<Option<StageClientError>>>,
    next_poll_error: Arc<RwLock<Option<StageClientError>>>,
    poll_delay: Arc<RwLock<Option<Duration>>>,
    polls: Arc<RwLock<Vec<String>>>,
    job_counter: Arc<RwLock<u32>>,
}

/// Mock ingestion service.
pub type MockIngestionClient = MockStageService<SourceRef, String>;
/// Mock detection service. The recorded input is the video location.
pub type MockDetectionClient = MockStageService<String, Vec<DetectedPlayer>>;
/// Mock analysis service.
pub type MockAnalysisClient = MockStageService<AnalysisInput, String>;

impl Default for MockIngestionClient {
    fn default() -> Self {
        Self::new("ingestion")
    }
}

impl Default for MockDetectionClient {
    fn default() -> Self {
        Self::new("detection")
    }
}

impl Default for MockAnalysisClient {
    fn default() -> Self {
        Self::new("analysis")
    }
}

impl<I: Clone, T: Clone> MockStageService<I, T> {
    /// Create a mock whose jobs stay processing until told otherwise.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            submitted: Arc::new(RwLock::new(Vec::new())),
            outcomes: Arc::new(RwLock::new(HashMap::new())),
            default_outcome: Arc::new(RwLock::new(PollOutcome::Processing)),
            next_submit_error: Arc::new(RwLock::new(None)),
            next_poll_error: Arc::new(RwLock::new(None)),
            poll_delay: Arc::new(RwLock::new(None)),
            polls: Arc::new(RwLock::new(Vec::new())),
            job_counter: Arc::new(RwLock::new(0)),
        }
    }

    /// Get all recorded submissions.
    pub async fn submissions(&self) -> Vec<RecordedSubmission<I>> {
        self.submitted.read().await.clone()
    }

    pub async fn submission_count(&self) -> usize {
        self.submitted.read().await.len()
    }

    /// Job ids polled so far, in order.
    pub async fn polled_jobs(&self) -> Vec<String> {
        self.polls.read().await.clone()
    }

    /// Set what polling `job_id` reports.
    pub async fn set_poll_outcome(&self, job_id: &str, outcome: PollOutcome<T>) {
        self.outcomes
            .write()
            .await
            .insert(job_id.to_string(), outcome);
    }

    /// Set what polling any job without an explicit outcome reports.
    pub async fn set_default_outcome(&self, outcome: PollOutcome<T>) {
        *self.default_outcome.write().await = outcome;
    }

    /// Configure the next submission to fail with the given error.
    pub async fn set_next_submit_error(&self, error: StageClientError) {
        *self.next_submit_error.write().await = Some(error);
    }

    /// Configure the next poll to fail with the given error.
    pub async fn set_next_poll_error(&self, error: StageClientError) {
        *self.next_poll_error.write().await = Some(error);
    }

    /// Delay every poll, to keep a reconciliation pass busy.
    pub async fn set_poll_delay(&self, delay: Duration) {
        *self.poll_delay.write().await = Some(delay);
    }

    async fn record_submission(
        &self,
        match_id: &str,
        input: I,
    ) -> Result<SubmittedJob, StageClientError> {
        if let Some(error) = self.next_submit_error.write().await.take() {
            return Err(error);
        }

        let job_id = {
            let mut counter = self.job_counter.write().await;
            *counter += 1;
            format!("{}-job-{}", self.name, *counter)
        };

        self.submitted.write().await.push(RecordedSubmission {
            match_id: match_id.to_string(),
            job_id: job_id.clone(),
            input,
            timestamp: Utc::now(),
        });

        Ok(SubmittedJob::new(job_id))
    }

    async fn record_poll(&self, job_id: &str) -> Result<PollOutcome<T>, StageClientError> {
        let delay = *self.poll_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.polls.write().await.push(job_id.to_string());

        if let Some(error) = self.next_poll_error.write().await.take() {
            return Err(error);
        }

        if let Some(outcome) = self.outcomes.read().await.get(job_id) {
            return Ok(outcome.clone());
        }
        Ok(self.default_outcome.read().await.clone())
    }
}

#[async_trait]
impl IngestionClient for MockIngestionClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(
        &self,
        match_id: &str,
        source: &SourceRef,
    ) -> Result<SubmittedJob, StageClientError> {
        self.record_submission(match_id, source.clone()).await
    }

    async fn poll(&self, job_id: &str) -> Result<PollOutcome<String>, StageClientError> {
        self.record_poll(job_id).await
    }
}

#[async_trait]
impl DetectionClient for MockDetectionClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(
        &self,
        match_id: &str,
        video_location: &str,
    ) -> Result<SubmittedJob, StageClientError> {
        self.record_submission(match_id, video_location.to_string())
            .await
    }

    async fn poll(
        &self,
        job_id: &str,
    ) -> Result<PollOutcome<Vec<DetectedPlayer>>, StageClientError> {
        self.record_poll(job_id).await
    }
}

#[async_trait]
impl AnalysisClient for MockAnalysisClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(
        &self,
        match_id: &str,
        video_location: &str,
        assignments: &[PlayerAssignment],
    ) -> Result<SubmittedJob, StageClientError> {
        let input = AnalysisInput {
            video_location: video_location.to_string(),
            assignments: assignments.to_vec(),
        };
        self.record_submission(match_id, input).await
    }

    async fn poll(&self, job_id: &str) -> Result<PollOutcome<String>, StageClientError> {
        self.record_poll(job_id).await
    }
}
