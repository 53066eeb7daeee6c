//! Reconciler API handlers.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use matchflow_core::{reconciler::ReconcilerError, ReconcilerStatus, TickReport};

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

/// Reconciler status response
#[derive(Debug, Serialize)]
pub struct ReconcilerStatusResponse {
    /// Whether the reconciler is enabled in config
    pub available: bool,
    #[serde(flatten)]
    pub status: ReconcilerStatus,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ReconcilerErrorResponse {
    pub error: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get reconciler status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ReconcilerStatusResponse> {
    match state.reconciler() {
        Some(reconciler) => Json(ReconcilerStatusResponse {
            available: true,
            status: reconciler.status().await,
        }),
        None => Json(ReconcilerStatusResponse {
            available: false,
            status: ReconcilerStatus::default(),
        }),
    }
}

/// Run one tick now instead of waiting for the interval
pub async fn tick(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TickReport>, impl IntoResponse> {
    let Some(reconciler) = state.reconciler() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReconcilerErrorResponse {
                error: "Reconciler not enabled".to_string(),
            }),
        ));
    };

    match reconciler.tick_now().await {
        Ok(report) => Ok(Json(report)),
        Err(e @ ReconcilerError::TickInProgress) => Err((
            StatusCode::CONFLICT,
            Json(ReconcilerErrorResponse {
                error: e.to_string(),
            }),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ReconcilerErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}
