//! Lease storage trait and types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid lease TTL: {0:?}")]
    InvalidTtl(Duration),
}

/// Advisory, time-boxed ownership of a resource key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Resource key, e.g. `player_<match id>`.
    pub resource_key: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// A lease is expired once `now` reaches its expiry time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Trait for lease backends.
///
/// Implementations must be linearizable per key: within a TTL window at most
/// one caller observes `acquire == true`.
pub trait LeaseStore: Send + Sync {
    /// Take the lease on `key` for `ttl`.
    ///
    /// An expired lease on the key is deleted first. Returns false, without
    /// mutating anything, if a live lease exists.
    fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LeaseError>;

    /// Remove the lease on `key`, whoever holds it.
    fn release(&self, key: &str) -> Result<(), LeaseError>;

    /// Remove every expired lease. Returns the number removed.
    fn sweep(&self) -> Result<usize, LeaseError>;

    /// Get the lease row for `key`, expired or not.
    fn get(&self, key: &str) -> Result<Option<Lease>, LeaseError>;
}
