use std::sync::Arc;

use matchflow_core::{
    Config, MatchReconciler, NotificationStore, SanitizedConfig, StageEngine,
};

/// Shared application state
pub struct AppState {
    config: Config,
    engine: Arc<StageEngine>,
    reconciler: Option<Arc<MatchReconciler>>,
    notification_store: Arc<dyn NotificationStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        engine: Arc<StageEngine>,
        reconciler: Option<Arc<MatchReconciler>>,
        notification_store: Arc<dyn NotificationStore>,
    ) -> Self {
        Self {
            config,
            engine,
            reconciler,
            notification_store,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn engine(&self) -> &Arc<StageEngine> {
        &self.engine
    }

    /// The reconciler, if enabled in config.
    pub fn reconciler(&self) -> Option<&Arc<MatchReconciler>> {
        self.reconciler.as_ref()
    }

    pub fn notification_store(&self) -> &Arc<dyn NotificationStore> {
        &self.notification_store
    }
}
