use std::sync::Arc;

use tokio::sync::mpsc;

use super::{NotificationEnvelope, NotificationHandle, NotificationRecord, NotificationStore};

/// Background task that receives notifications and writes them to the outbox
pub struct NotificationWriter {
    rx: mpsc::Receiver<NotificationEnvelope>,
    store: Arc<dyn NotificationStore>,
}

impl NotificationWriter {
    /// Create a new notification writer
    pub fn new(rx: mpsc::Receiver<NotificationEnvelope>, store: Arc<dyn NotificationStore>) -> Self {
        Self { rx, store }
    }

    /// Run the writer, consuming notifications until every handle is dropped
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        tracing::info!("Notification writer started");

        while let Some(envelope) = self.rx.recv().await {
            let record = NotificationRecord {
                id: 0, // Will be set by database
                timestamp: envelope.timestamp,
                owner_id: envelope.owner_id,
                event_type: envelope.event.event_type().to_string(),
                match_id: envelope.event.match_id().to_string(),
                data: envelope.event,
            };

            if let Err(e) = self.store.insert(&record) {
                tracing::error!("Failed to write notification: {}", e);
            }
        }

        tracing::info!("Notification writer shutting down");
    }
}

/// Create a complete notification system
///
/// Returns:
/// - `NotificationHandle` - for emitting events (clone this to share across tasks)
/// - `NotificationWriter` - spawn this as a background task with `tokio::spawn(writer.run())`
pub fn create_notification_system(
    store: Arc<dyn NotificationStore>,
    buffer_size: usize,
) -> (NotificationHandle, NotificationWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let handle = NotificationHandle::new(tx);
    let writer = NotificationWriter::new(rx, store);
    (handle, writer)
}
