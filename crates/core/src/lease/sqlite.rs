use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, TransactionBehavior};

use super::{Lease, LeaseError, LeaseStore};

/// SQLite-backed lease table.
///
/// Acquisition runs in an immediate transaction, so callers sharing the
/// database file through separate connections (or processes) are serialized.
pub struct SqliteLeaseStore {
    conn: Mutex<Connection>,
}

impl SqliteLeaseStore {
    /// Create a new SQLite lease store, creating the database file and tables if needed
    pub fn new(path: &Path) -> Result<Self, LeaseError> {
        let conn = Connection::open(path).map_err(|e| LeaseError::Database(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| LeaseError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite lease store (useful for testing)
    pub fn in_memory() -> Result<Self, LeaseError> {
        let conn = Connection::open_in_memory().map_err(|e| LeaseError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), LeaseError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS processing_locks (
                resource_key TEXT PRIMARY KEY,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_processing_locks_expires_at ON processing_locks(expires_at);
            "#,
        )
        .map_err(|e| LeaseError::Database(e.to_string()))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LeaseError> {
        self.conn
            .lock()
            .map_err(|_| LeaseError::Database("connection mutex poisoned".to_string()))
    }

    fn from_millis(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }
}

impl LeaseStore for SqliteLeaseStore {
    fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let ttl_chrono = chrono::Duration::from_std(ttl).map_err(|_| LeaseError::InvalidTtl(ttl))?;
        if ttl_chrono <= chrono::Duration::zero() {
            return Err(LeaseError::InvalidTtl(ttl));
        }

        let mut conn = self.conn()?;
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let expires_ms = (now + ttl_chrono).timestamp_millis();

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| LeaseError::Database(e.to_string()))?;

        tx.execute(
            "DELETE FROM processing_locks WHERE resource_key = ? AND expires_at <= ?",
            params![key, now_ms],
        )
        .map_err(|e| LeaseError::Database(e.to_string()))?;

        let inserted = tx
            .execute(
                "INSERT INTO processing_locks (resource_key, acquired_at, expires_at) VALUES (?, ?, ?) ON CONFLICT(resource_key) DO NOTHING",
                params![key, now_ms, expires_ms],
            )
            .map_err(|e| LeaseError::Database(e.to_string()))?;

        tx.commit()
            .map_err(|e| LeaseError::Database(e.to_string()))?;

        Ok(inserted == 1)
    }

    fn release(&self, key: &str) -> Result<(), LeaseError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM processing_locks WHERE resource_key = ?",
            params![key],
        )
        .map_err(|e| LeaseError::Database(e.to_string()))?;
        Ok(())
    }

    fn sweep(&self) -> Result<usize, LeaseError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM processing_locks WHERE expires_at <= ?",
            params![Utc::now().timestamp_millis()],
        )
        .map_err(|e| LeaseError::Database(e.to_string()))
    }

    fn get(&self, key: &str) -> Result<Option<Lease>, LeaseError> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT resource_key, acquired_at, expires_at FROM processing_locks WHERE resource_key = ?",
            params![key],
            |row| {
                Ok(Lease {
                    resource_key: row.get(0)?,
                    acquired_at: Self::from_millis(row.get(1)?),
                    expires_at: Self::from_millis(row.get(2)?),
                })
            },
        );

        match result {
            Ok(lease) => Ok(Some(lease)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(LeaseError::Database(e.to_string())),
        }
    }
}
