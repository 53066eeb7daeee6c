//! Advisory leases serializing reconciliation work per match and stage.

mod sqlite;
mod store;

pub use sqlite::SqliteLeaseStore;
pub use store::{Lease, LeaseError, LeaseStore};
