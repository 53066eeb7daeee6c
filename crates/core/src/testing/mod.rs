//! Testing utilities and mock implementations.
//!
//! This module provides mock stage services, a recording notification sink
//! and an engine harness, allowing end-to-end tests without real services.
//!
//! # Example
//!
//! ```rust,ignore
//! use matchflow_core::testing::{fixtures, EngineHarness};
//! use matchflow_core::stage::PollOutcome;
//!
//! let h = EngineHarness::new()?;
//! let m = h.detected_match("owner-1", fixtures::players(4))?;
//!
//! h.engine.request_analysis(&m.id, fixtures::assignments(&["p1", "p2"])).await?;
//! h.analysis
//!     .set_poll_outcome("analysis-job-1", PollOutcome::Completed("s3://reports/1.json".into()))
//!     .await;
//! ```

mod harness;
mod mock_stage_clients;
mod recording_sink;

pub use harness::{EngineHarness, EngineHarnessBuilder};
pub use mock_stage_clients::{
    AnalysisInput, MockAnalysisClient, MockDetectionClient, MockIngestionClient,
    MockStageService, RecordedSubmission,
};
pub use recording_sink::{RecordedNotification, RecordingNotificationSink};

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::matches::{DetectedPlayer, PlayerAssignment, SourceRef};

    pub fn upload_source(object_key: &str) -> SourceRef {
        SourceRef::Upload {
            object_key: object_key.to_string(),
        }
    }

    pub fn link_source(url: &str) -> SourceRef {
        SourceRef::Link {
            url: url.to_string(),
        }
    }

    /// Players `p1..=pN` with decreasing confidence.
    pub fn players(count: usize) -> Vec<DetectedPlayer> {
        (1..=count)
            .map(|i| DetectedPlayer {
                player_id: format!("p{}", i),
                label: Some(format!("Player {}", i)),
                confidence: Some(1.0 - (i as f32 * 0.01)),
            })
            .collect()
    }

    /// Assign the given players alternately to `home` and `away`.
    pub fn assignments(player_ids: &[&str]) -> Vec<PlayerAssignment> {
        player_ids
            .iter()
            .enumerate()
            .map(|(i, id)| PlayerAssignment {
                player_id: id.to_string(),
                team: if i % 2 == 0 { "home" } else { "away" }.to_string(),
                jersey_number: Some(i as u16 + 1),
                name: None,
            })
            .collect()
    }
}
