//! Common test utilities for API testing with mocks.
//!
//! This module provides a test fixture that builds the router in-process
//! with mock stage services injected, so the API can be exercised without
//! any external infrastructure.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use matchflow_core::{
    create_notification_system,
    matches::{CreateMatchRequest, Match, StageName, StageStatus},
    notify::NotificationFilter,
    testing::{MockAnalysisClient, MockDetectionClient, MockIngestionClient},
    AnalysisClient, Config, DetectionClient, IngestionClient, MatchReconciler,
    MatchStore, NotificationStore, PollOutcome, ReconcilerConfig, SqliteLeaseStore, SqliteMatchStore,
    SqliteNotificationStore, StageEngine, StagePolicies, StageServices,
};
use matchflow_server::{api::create_router, state::AppState};

/// Re-export fixtures for test convenience
pub use matchflow_core::testing::fixtures;

/// Test fixture for API testing with mock stage services.
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_match_creation() {
///     let fixture = TestFixture::new().await;
///
///     let response = fixture.post("/api/v1/matches", json!({
///         "owner_id": "coach-1",
///         "source": { "type": "upload", "object_key": "uploads/final.mp4" }
///     })).await;
///
///     assert_eq!(response.status, 201);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    pub engine: Arc<StageEngine>,
    pub match_store: Arc<SqliteMatchStore>,
    pub notification_store: Arc<SqliteNotificationStore>,
    pub ingestion: Arc<MockIngestionClient>,
    pub detection: Arc<MockDetectionClient>,
    pub analysis: Arc<MockAnalysisClient>,
    /// Present when the fixture was built with the reconciler enabled
    pub reconciler: Option<Arc<MatchReconciler>>,
    /// Temporary directory for the test database
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Create a new test fixture with default mocks.
    pub async fn new() -> Self {
        Self::with_config(TestConfig::default()).await
    }

    /// Create a test fixture with custom configuration.
    pub async fn with_config(test_config: TestConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let ingestion = Arc::new(MockIngestionClient::default());
        let detection = Arc::new(MockDetectionClient::default());
        let analysis = Arc::new(MockAnalysisClient::default());

        let mut config = Config::default();
        config.database.path = db_path.clone();
        config.reconciler = ReconcilerConfig {
            enabled: test_config.enable_reconciler,
            ..Default::default()
        };

        let match_store =
            Arc::new(SqliteMatchStore::new(&db_path).expect("Failed to create match store"));
        let lease_store =
            Arc::new(SqliteLeaseStore::new(&db_path).expect("Failed to create lease store"));
        let notification_store = Arc::new(
            SqliteNotificationStore::new(&db_path).expect("Failed to create notification store"),
        );

        let (notifications, writer) = create_notification_system(
            Arc::clone(&notification_store) as Arc<dyn NotificationStore>,
            100,
        );
        tokio::spawn(writer.run());

        let services = StageServices {
            ingestion: Some(Arc::clone(&ingestion) as Arc<dyn IngestionClient>),
            detection: Some(Arc::clone(&detection) as Arc<dyn DetectionClient>),
            analysis: (!test_config.without_analysis)
                .then(|| Arc::clone(&analysis) as Arc<dyn AnalysisClient>),
        };

        let engine = Arc::new(StageEngine::new(
            Arc::clone(&match_store) as Arc<dyn MatchStore>,
            lease_store,
            services,
            StagePolicies::default(),
            Arc::new(notifications),
            Duration::from_secs(30),
        ));

        // Ticks are driven through the API; the loop itself is never started.
        let reconciler = test_config.enable_reconciler.then(|| {
            Arc::new(MatchReconciler::new(
                config.reconciler.clone(),
                Arc::clone(&engine),
            ))
        });

        let state = Arc::new(AppState::new(
            config,
            Arc::clone(&engine),
            reconciler.clone(),
            Arc::clone(&notification_store) as Arc<dyn NotificationStore>,
        ));

        let router = create_router(state);

        Self {
            router,
            engine,
            match_store,
            notification_store,
            ingestion,
            detection,
            analysis,
            reconciler,
            temp_dir,
        }
    }

    /// Read a match straight from the store, bypassing read-time corrections.
    pub fn stored(&self, match_id: &str) -> Match {
        self.match_store
            .get(match_id)
            .expect("Failed to read match")
            .expect("Match not found")
    }

    /// Drive a fresh match through ingestion and detection using the mocks.
    pub async fn detected_match(&self, owner_id: &str, players: usize) -> Match {
        let created = self
            .engine
            .create_match(CreateMatchRequest {
                owner_id: owner_id.to_string(),
                source: Some(fixtures::upload_source("uploads/match.mp4")),
            })
            .await
            .expect("Failed to create match");

        let ingestion_job = created.ingestion.progress.job_id.clone().unwrap();
        self.ingestion
            .set_poll_outcome(
                &ingestion_job,
                PollOutcome::Completed("s3://videos/match.mp4".to_string()),
            )
            .await;
        self.engine
            .reconcile(&created.id, StageName::Ingestion)
            .await
            .expect("Failed to reconcile ingestion");

        let detection_job = self.stored(&created.id).detection.progress.job_id.unwrap();
        self.detection
            .set_poll_outcome(&detection_job, PollOutcome::Completed(fixtures::players(players)))
            .await;
        self.engine
            .reconcile(&created.id, StageName::Detection)
            .await
            .expect("Failed to reconcile detection");

        let detected = self.stored(&created.id);
        assert_eq!(detected.detection.progress.status, StageStatus::Completed);
        detected
    }

    /// Wait until the outbox holds at least `count` notifications for the match.
    pub async fn wait_for_notifications(&self, match_id: &str, count: i64) -> bool {
        let filter = NotificationFilter::new().with_match_id(match_id);
        for _ in 0..100 {
            if self.notification_store.count(&filter).unwrap_or(0) >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a POST request with raw string body (for testing malformed JSON).
    pub async fn post_raw(&self, path: &str, body: &str) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Fetch a plain-text endpoint.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}

/// Configuration for test fixture.
#[derive(Debug, Clone, Default)]
pub struct TestConfig {
    /// Build a reconciler so the tick and status endpoints are live
    pub enable_reconciler: bool,
    /// Leave the analysis service unconfigured
    pub without_analysis: bool,
}

impl TestConfig {
    /// Create config with the reconciler enabled.
    pub fn with_reconciler() -> Self {
        Self {
            enable_reconciler: true,
            without_analysis: false,
        }
    }

    /// Create config without an analysis service.
    pub fn without_analysis() -> Self {
        Self {
            enable_reconciler: false,
            without_analysis: true,
        }
    }
}
