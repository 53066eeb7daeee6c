pub mod config;
pub mod engine;
pub mod lease;
pub mod matches;
pub mod metrics;
pub mod notify;
pub mod reconciler;
pub mod stage;
pub mod stage_client;
pub mod testing;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use engine::{EngineError, ReconcileOutcome, StageEngine, StageServices, WebhookOutcome};
pub use lease::{LeaseError, LeaseStore, SqliteLeaseStore};
pub use matches::{
    CreateMatchRequest, Match, MatchError, MatchFilter, MatchStore, SqliteMatchStore, StageName,
    StageStatus,
};
pub use notify::{
    create_notification_system, NotificationEvent, NotificationHandle, NotificationSink,
    NotificationStore, NotificationWriter, SqliteNotificationStore,
};
pub use reconciler::{MatchReconciler, ReconcilerConfig, ReconcilerStatus, TickReport};
pub use stage::{PollOutcome, RetryPolicy, StagePolicies};
pub use stage_client::{
    AnalysisClient, DetectionClient, HttpAnalysisClient, HttpDetectionClient,
    HttpIngestionClient, IngestionClient, JobStatusPayload, StageClientError,
};
