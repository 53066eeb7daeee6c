use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::NotificationEvent;
use crate::metrics;

/// Where stage transition events go.
///
/// Fire-and-forget: delivery failures are logged, never returned, and a
/// notification may be delivered more than once.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, owner_id: &str, event: NotificationEvent);
}

/// Envelope wrapping a notification with metadata
#[derive(Debug, Clone)]
pub struct NotificationEnvelope {
    pub timestamp: DateTime<Utc>,
    pub owner_id: String,
    pub event: NotificationEvent,
}

/// Handle for emitting notifications
///
/// This is cheaply cloneable and can be shared across tasks.
/// Events are sent through an async channel to be written by the NotificationWriter.
#[derive(Clone)]
pub struct NotificationHandle {
    tx: mpsc::Sender<NotificationEnvelope>,
}

impl NotificationHandle {
    /// Create a new notification handle from a channel sender
    pub fn new(tx: mpsc::Sender<NotificationEnvelope>) -> Self {
        Self { tx }
    }

    fn envelope(owner_id: &str, event: NotificationEvent) -> NotificationEnvelope {
        NotificationEnvelope {
            timestamp: Utc::now(),
            owner_id: owner_id.to_string(),
            event,
        }
    }
}

#[async_trait]
impl NotificationSink for NotificationHandle {
    /// Waits for channel capacity; if the channel is closed the error is
    /// logged but the caller is not failed.
    async fn emit(&self, owner_id: &str, event: NotificationEvent) {
        let event_type = event.event_type();
        match self.tx.send(Self::envelope(owner_id, event)).await {
            Ok(()) => metrics::NOTIFICATIONS_EMITTED
                .with_label_values(&[event_type])
                .inc(),
            Err(e) => {
                metrics::NOTIFICATIONS_DROPPED.inc();
                tracing::error!("Failed to emit notification: {}", e);
            }
        }
    }
}
