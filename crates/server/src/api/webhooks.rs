//! Webhook intake for the stage services.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;
use tracing::debug;

use matchflow_core::{JobStatusPayload, WebhookOutcome};

use super::matches::engine_error;
use crate::state::AppState;

fn status_for(outcome: &WebhookOutcome) -> StatusCode {
    match outcome {
        WebhookOutcome::Applied { .. }
        | WebhookOutcome::Duplicate { .. }
        | WebhookOutcome::Stale { .. } => StatusCode::OK,
        WebhookOutcome::Deferred { .. } => StatusCode::ACCEPTED,
        WebhookOutcome::UnknownJob { .. } => StatusCode::NOT_FOUND,
    }
}

/// Job status pushed by the ingestion service.
///
/// Delivery is at-least-once; redeliveries answer 200 without side effects.
/// A 202 means the match was busy and the next poll will fold the result in.
pub async fn ingestion(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JobStatusPayload>,
) -> Result<(StatusCode, Json<WebhookOutcome>), impl IntoResponse> {
    debug!(job_id = ?payload.job_id, status = %payload.status, "Ingestion webhook received");

    match state.engine().handle_ingestion_webhook(payload).await {
        Ok(outcome) => Ok((status_for(&outcome), Json(outcome))),
        Err(e) => Err(engine_error(e)),
    }
}
