//! Clients for the external ingestion, detection and analysis services.

mod http;
pub mod payload;
mod types;

pub use http::{HttpAnalysisClient, HttpDetectionClient, HttpIngestionClient};
pub use payload::JobStatusPayload;
pub use types::{
    AnalysisClient, DetectionClient, IngestionClient, StageClientError, SubmittedJob,
};
