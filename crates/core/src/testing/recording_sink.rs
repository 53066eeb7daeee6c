//! Notification sink that keeps every event in memory.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::notify::{NotificationEvent, NotificationSink};

/// An emitted notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedNotification {
    pub owner_id: String,
    pub event: NotificationEvent,
}

/// Records notifications for assertions instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    events: RwLock<Vec<RecordedNotification>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notifications(&self) -> Vec<RecordedNotification> {
        self.events.read().await.clone()
    }

    /// Event types in emission order, e.g. `["ingestion_started"]`.
    pub async fn event_types(&self) -> Vec<&'static str> {
        self.events
            .read()
            .await
            .iter()
            .map(|n| n.event.event_type())
            .collect()
    }

    /// How many events of the given type were emitted.
    pub async fn count(&self, event_type: &str) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|n| n.event.event_type() == event_type)
            .count()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn emit(&self, owner_id: &str, event: NotificationEvent) {
        self.events.write().await.push(RecordedNotification {
            owner_id: owner_id.to_string(),
            event,
        });
    }
}
