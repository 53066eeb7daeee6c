//! Periodic reconciliation of in-flight match stages.
//!
//! Every tick selects the matches whose stages may need work:
//! - **Ingestion**: `processing`
//! - **Detection**: `not_started` or `processing`, with ingestion `completed`
//! - **Analysis**: `pending` or `processing`
//!
//! and advances each of them by one step under its stage lease.

mod config;
mod runner;
mod types;

pub use config::ReconcilerConfig;
pub use runner::{scan_filter, MatchReconciler};
pub use types::{ReconcilerError, ReconcilerStatus, ScanReport, TickReport};
