//! HTTP stage clients.
//!
//! Every service speaks the same job protocol: `POST {base}/jobs` to submit,
//! `GET {base}/jobs/{id}` to poll.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use crate::config::ServiceConfig;
use crate::matches::{DetectedPlayer, PlayerAssignment, SourceRef};
use crate::metrics;
use crate::stage::PollOutcome;

use super::payload::{JobStatusPayload, SubmitResponse};
use super::{AnalysisClient, DetectionClient, IngestionClient, StageClientError, SubmittedJob};

/// Shared plumbing for one job API.
struct JobApi {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    service: &'static str,
}

impl JobApi {
    fn new(service: &'static str, config: &ServiceConfig) -> Result<Self, StageClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| {
                StageClientError::ConnectionFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            service,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn submit<B: Serialize + ?Sized>(&self, body: &B) -> Result<SubmittedJob, StageClientError> {
        let url = format!("{}/jobs", self.base_url);
        let result = self.submit_inner(&url, body).await;
        record_call(self.service, "submit", &result);
        result
    }

    async fn submit_inner<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<SubmittedJob, StageClientError> {
        let response = self
            .authorize(self.client.post(url).json(body))
            .send()
            .await
            .map_err(map_send_error)?;

        let response = check_status(response, None).await?;
        let parsed: SubmitResponse = response.json().await.map_err(|e| {
            StageClientError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        if parsed.job_id.trim().is_empty() {
            return Err(StageClientError::InvalidResponse(
                "Submission accepted without a job id".to_string(),
            ));
        }

        debug!(service = self.service, job_id = %parsed.job_id, "Job submitted");
        Ok(SubmittedJob::new(parsed.job_id))
    }

    async fn fetch(&self, job_id: &str) -> Result<JobStatusPayload, StageClientError> {
        let url = format!("{}/jobs/{}", self.base_url, urlencoding::encode(job_id));
        let result = self.fetch_inner(&url, job_id).await;
        record_call(self.service, "poll", &result);
        result
    }

    async fn fetch_inner(&self, url: &str, job_id: &str) -> Result<JobStatusPayload, StageClientError> {
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(map_send_error)?;

        let response = check_status(response, Some(job_id)).await?;
        response.json().await.map_err(|e| {
            StageClientError::InvalidResponse(format!("Failed to parse response: {}", e))
        })
    }
}

fn map_send_error(e: reqwest::Error) -> StageClientError {
    if e.is_timeout() {
        StageClientError::Timeout
    } else if e.is_connect() {
        StageClientError::ConnectionFailed(e.to_string())
    } else {
        StageClientError::ApiError {
            status: 0,
            message: e.to_string(),
        }
    }
}

async fn check_status(
    response: reqwest::Response,
    job_id: Option<&str>,
) -> Result<reqwest::Response, StageClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(status, job_id, &body))
}

/// Map a non-success HTTP status to a client error.
///
/// 404 is only "not found" when asking about a specific job; on submission
/// it means the endpoint is wrong, which is worth retrying after a fix.
fn error_for_status(status: StatusCode, job_id: Option<&str>, body: &str) -> StageClientError {
    let message: String = body.chars().take(200).collect();
    match (status.as_u16(), job_id) {
        (404, Some(job_id)) => StageClientError::NotFound(job_id.to_string()),
        (400 | 422, _) => StageClientError::Rejected(message),
        _ => StageClientError::ApiError {
            status: status.as_u16(),
            message,
        },
    }
}

fn record_call<T>(service: &str, operation: &str, result: &Result<T, StageClientError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::STAGE_CLIENT_CALLS
        .with_label_values(&[service, operation, outcome])
        .inc();
}

// ============================================================================
// Ingestion
// ============================================================================

#[derive(Serialize)]
struct IngestionJobRequest<'a> {
    match_id: &'a str,
    source: &'a SourceRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<&'a str>,
}

/// Ingestion (upload/download) service client.
pub struct HttpIngestionClient {
    api: JobApi,
    callback_url: Option<String>,
}

impl HttpIngestionClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, StageClientError> {
        Ok(Self {
            api: JobApi::new("ingestion", config)?,
            callback_url: config.callback_url.clone(),
        })
    }
}

#[async_trait]
impl IngestionClient for HttpIngestionClient {
    fn name(&self) -> &str {
        self.api.service
    }

    async fn submit(
        &self,
        match_id: &str,
        source: &SourceRef,
    ) -> Result<SubmittedJob, StageClientError> {
        self.api
            .submit(&IngestionJobRequest {
                match_id,
                source,
                callback_url: self.callback_url.as_deref(),
            })
            .await
    }

    async fn poll(&self, job_id: &str) -> Result<PollOutcome<String>, StageClientError> {
        Ok(self.api.fetch(job_id).await?.into_ingestion_outcome())
    }
}

// ============================================================================
// Detection
// ============================================================================

#[derive(Serialize)]
struct DetectionJobRequest<'a> {
    match_id: &'a str,
    video_url: &'a str,
}

/// Player detection service client.
pub struct HttpDetectionClient {
    api: JobApi,
}

impl HttpDetectionClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, StageClientError> {
        Ok(Self {
            api: JobApi::new("detection", config)?,
        })
    }
}

#[async_trait]
impl DetectionClient for HttpDetectionClient {
    fn name(&self) -> &str {
        self.api.service
    }

    async fn submit(
        &self,
        match_id: &str,
        video_location: &str,
    ) -> Result<SubmittedJob, StageClientError> {
        self.api
            .submit(&DetectionJobRequest {
                match_id,
                video_url: video_location,
            })
            .await
    }

    async fn poll(
        &self,
        job_id: &str,
    ) -> Result<PollOutcome<Vec<DetectedPlayer>>, StageClientError> {
        Ok(self.api.fetch(job_id).await?.into_detection_outcome())
    }
}

// ============================================================================
// Analysis
// ============================================================================

#[derive(Serialize)]
struct AnalysisJobRequest<'a> {
    match_id: &'a str,
    video_url: &'a str,
    assignments: &'a [PlayerAssignment],
}

/// Video analysis service client.
pub struct HttpAnalysisClient {
    api: JobApi,
}

impl HttpAnalysisClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, StageClientError> {
        Ok(Self {
            api: JobApi::new("analysis", config)?,
        })
    }
}

#[async_trait]
impl AnalysisClient for HttpAnalysisClient {
    fn name(&self) -> &str {
        self.api.service
    }

    async fn submit(
        &self,
        match_id: &str,
        video_location: &str,
        assignments: &[PlayerAssignment],
    ) -> Result<SubmittedJob, StageClientError> {
        self.api
            .submit(&AnalysisJobRequest {
                match_id,
                video_url: video_location,
                assignments,
            })
            .await
    }

    async fn poll(&self, job_id: &str) -> Result<PollOutcome<String>, StageClientError> {
        Ok(self.api.fetch(job_id).await?.into_analysis_outcome())
    }
}
