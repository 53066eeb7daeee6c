//! Stage engine: user actions, reconciliation steps, webhooks and
//! read-time corrections, all serialized by per-stage leases.

mod error;
mod stage_engine;
mod types;

pub use error::EngineError;
pub use stage_engine::StageEngine;
pub use types::{AppliedCorrection, ReconcileOutcome, StageResult, StageServices, WebhookOutcome};
