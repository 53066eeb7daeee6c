use thiserror::Error;

use super::NotificationRecord;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Filter for querying the notification outbox
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub match_id: Option<String>,
    pub owner_id: Option<String>,
    pub event_type: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl NotificationFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            offset: 0,
            ..Default::default()
        }
    }

    pub fn with_match_id(mut self, match_id: impl Into<String>) -> Self {
        self.match_id = Some(match_id.into());
        self
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Trait for notification outbox storage
pub trait NotificationStore: Send + Sync {
    /// Insert a notification, returns the assigned ID
    fn insert(&self, record: &NotificationRecord) -> Result<i64, NotificationError>;

    /// Query notifications, oldest first
    fn query(&self, filter: &NotificationFilter) -> Result<Vec<NotificationRecord>, NotificationError>;

    /// Count matching notifications
    fn count(&self, filter: &NotificationFilter) -> Result<i64, NotificationError>;
}
