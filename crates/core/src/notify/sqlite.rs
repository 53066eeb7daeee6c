use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{NotificationError, NotificationEvent, NotificationFilter, NotificationRecord, NotificationStore};

/// SQLite-backed notification outbox
pub struct SqliteNotificationStore {
    conn: Mutex<Connection>,
}

impl SqliteNotificationStore {
    /// Create a new SQLite notification store, creating the database file and tables if needed
    pub fn new(path: &Path) -> Result<Self, NotificationError> {
        let conn =
            Connection::open(path).map_err(|e| NotificationError::Database(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| NotificationError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite notification store (useful for testing)
    pub fn in_memory() -> Result<Self, NotificationError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| NotificationError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), NotificationError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                match_id TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_notifications_match_id ON notifications(match_id);
            CREATE INDEX IF NOT EXISTS idx_notifications_owner_id ON notifications(owner_id);
            CREATE INDEX IF NOT EXISTS idx_notifications_event_type ON notifications(event_type);
            "#,
        )
        .map_err(|e| NotificationError::Database(e.to_string()))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, NotificationError> {
        self.conn
            .lock()
            .map_err(|_| NotificationError::Database("connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &NotificationFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref match_id) = filter.match_id {
            conditions.push("match_id = ?");
            params.push(Box::new(match_id.clone()));
        }

        if let Some(ref owner_id) = filter.owner_id {
            conditions.push("owner_id = ?");
            params.push(Box::new(owner_id.clone()));
        }

        if let Some(ref event_type) = filter.event_type {
            conditions.push("event_type = ?");
            params.push(Box::new(event_type.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }
}

impl NotificationStore for SqliteNotificationStore {
    fn insert(&self, record: &NotificationRecord) -> Result<i64, NotificationError> {
        let conn = self.conn()?;

        let data_json = serde_json::to_string(&record.data)
            .map_err(|e| NotificationError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO notifications (timestamp, owner_id, event_type, match_id, data) VALUES (?, ?, ?, ?, ?)",
            params![
                record.timestamp.to_rfc3339(),
                record.owner_id,
                record.event_type,
                record.match_id,
                data_json,
            ],
        )
        .map_err(|e| NotificationError::Database(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    fn query(&self, filter: &NotificationFilter) -> Result<Vec<NotificationRecord>, NotificationError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT id, timestamp, owner_id, event_type, match_id, data FROM notifications {} ORDER BY id ASC LIMIT ? OFFSET ?",
            where_clause
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| NotificationError::Database(e.to_string()))?;

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                let id: i64 = row.get(0)?;
                let timestamp_str: String = row.get(1)?;
                let owner_id: String = row.get(2)?;
                let event_type: String = row.get(3)?;
                let match_id: String = row.get(4)?;
                let data_json: String = row.get(5)?;

                Ok((id, timestamp_str, owner_id, event_type, match_id, data_json))
            })
            .map_err(|e| NotificationError::Database(e.to_string()))?;

        let mut records = Vec::new();
        for row_result in rows {
            let (id, timestamp_str, owner_id, event_type, match_id, data_json) =
                row_result.map_err(|e| NotificationError::Database(e.to_string()))?;

            let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&timestamp_str)
                .map_err(|e| NotificationError::Database(format!("Invalid timestamp: {}", e)))?
                .into();

            let data: NotificationEvent = serde_json::from_str(&data_json)
                .map_err(|e| NotificationError::Serialization(e.to_string()))?;

            records.push(NotificationRecord {
                id,
                timestamp,
                owner_id,
                event_type,
                match_id,
                data,
            });
        }

        Ok(records)
    }

    fn count(&self, filter: &NotificationFilter) -> Result<i64, NotificationError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM notifications {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(|e| NotificationError::Database(e.to_string()))
    }
}
