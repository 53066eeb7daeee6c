//! Match API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use matchflow_core::{
    engine::AppliedCorrection,
    matches::{PlayerAssignment, SourceRef},
    notify::{NotificationFilter, NotificationRecord},
    CreateMatchRequest, EngineError, Match, MatchError, MatchFilter, MatchStore, NotificationStore,
    StageName,
};

use crate::state::AppState;

/// Maximum allowed limit for list queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for list queries
const DEFAULT_LIMIT: i64 = 100;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for creating a match
#[derive(Debug, Deserialize)]
pub struct CreateMatchBody {
    /// User submitting the match
    pub owner_id: String,
    /// Uploaded or linked source; ingestion starts right away when present
    pub source: Option<SourceRef>,
}

/// Request body for submitting a remote link
#[derive(Debug, Deserialize)]
pub struct SubmitLinkBody {
    pub url: String,
}

/// Request body for requesting analysis
#[derive(Debug, Deserialize)]
pub struct RequestAnalysisBody {
    pub assignments: Vec<PlayerAssignment>,
}

/// Query parameters for listing matches
#[derive(Debug, Deserialize)]
pub struct ListMatchesParams {
    /// Filter by owner
    pub owner_id: Option<String>,
    /// Maximum number of matches to return
    pub limit: Option<i64>,
    /// Pagination offset
    pub offset: Option<i64>,
}

/// Query parameters for listing notifications
#[derive(Debug, Deserialize)]
pub struct ListNotificationsParams {
    /// Filter by event type (e.g. "detection_completed")
    pub event_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// A correction applied while reading the match
#[derive(Debug, Serialize)]
pub struct CorrectionResponse {
    pub stage: StageName,
    pub correction: &'static str,
}

impl From<AppliedCorrection> for CorrectionResponse {
    fn from(applied: AppliedCorrection) -> Self {
        Self {
            stage: applied.stage,
            correction: applied.correction.as_str(),
        }
    }
}

/// Response for match operations
#[derive(Debug, Serialize)]
pub struct MatchResponse {
    #[serde(flatten)]
    pub details: Match,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<CorrectionResponse>,
}

impl From<Match> for MatchResponse {
    fn from(details: Match) -> Self {
        Self {
            details,
            corrections: Vec::new(),
        }
    }
}

/// Response for listing matches
#[derive(Debug, Serialize)]
pub struct ListMatchesResponse {
    pub matches: Vec<Match>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Response for listing notifications
#[derive(Debug, Serialize)]
pub struct ListNotificationsResponse {
    pub notifications: Vec<NotificationRecord>,
    pub total: i64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct MatchErrorResponse {
    pub error: String,
}

pub(crate) type ErrorReply = (StatusCode, Json<MatchErrorResponse>);

fn error_reply(status: StatusCode, error: impl ToString) -> ErrorReply {
    (
        status,
        Json(MatchErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Map an engine error to an HTTP status.
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::MatchNotFound(_) | EngineError::Store(MatchError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        EngineError::Busy { .. } | EngineError::InvalidState { .. } => StatusCode::CONFLICT,
        EngineError::MissingInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Submission { .. } | EngineError::Poll { .. } => StatusCode::BAD_GATEWAY,
        EngineError::Store(_) | EngineError::Lease(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn engine_error(err: EngineError) -> ErrorReply {
    error_reply(status_for(&err), err)
}

// ============================================================================
// Handlers
// ============================================================================

/// Create a new match
pub async fn create_match(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateMatchBody>,
) -> Result<(StatusCode, Json<MatchResponse>), impl IntoResponse> {
    let request = CreateMatchRequest {
        owner_id: body.owner_id,
        source: body.source,
    };

    match state.engine().create_match(request).await {
        Ok(created) => Ok((StatusCode::CREATED, Json(MatchResponse::from(created)))),
        Err(e) => Err(engine_error(e)),
    }
}

/// Get a match by ID.
///
/// Reading a match applies the read-time corrections: a processing stage
/// gets a fresh retry budget and a recoverable failed stage is reset.
pub async fn get_match(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MatchResponse>, impl IntoResponse> {
    match state.engine().visit_with_corrections(&id).await {
        Ok((details, corrections)) => Ok(Json(MatchResponse {
            details,
            corrections: corrections.into_iter().map(Into::into).collect(),
        })),
        Err(e) => Err(engine_error(e)),
    }
}

/// List matches with optional filters
pub async fn list_matches(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListMatchesParams>,
) -> Result<Json<ListMatchesResponse>, ErrorReply> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = MatchFilter::new().with_limit(limit).with_offset(offset);
    if let Some(owner_id) = params.owner_id {
        filter = filter.with_owner(owner_id);
    }

    let store = state.engine().matches();
    let matches = store
        .list(&filter)
        .map_err(|e| error_reply(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let total = store
        .count(&filter)
        .map_err(|e| error_reply(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    Ok(Json(ListMatchesResponse {
        matches,
        total,
        limit,
        offset,
    }))
}

/// Attach a remote link to a match and start ingestion
pub async fn submit_link(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SubmitLinkBody>,
) -> Result<Json<MatchResponse>, impl IntoResponse> {
    match state.engine().submit_link(&id, &body.url).await {
        Ok(updated) => Ok(Json(MatchResponse::from(updated))),
        Err(e) => Err(engine_error(e)),
    }
}

/// Store player assignments and request analysis
pub async fn request_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RequestAnalysisBody>,
) -> Result<Json<MatchResponse>, impl IntoResponse> {
    match state.engine().request_analysis(&id, body.assignments).await {
        Ok(updated) => Ok(Json(MatchResponse::from(updated))),
        Err(e) => Err(engine_error(e)),
    }
}

/// Submit a single stage by hand
pub async fn submit_stage(
    State(state): State<Arc<AppState>>,
    Path((id, stage)): Path<(String, StageName)>,
) -> Result<Json<MatchResponse>, impl IntoResponse> {
    match state.engine().submit(&id, stage).await {
        Ok(updated) => Ok(Json(MatchResponse::from(updated))),
        Err(e) => Err(engine_error(e)),
    }
}

/// Notifications recorded for a match, oldest first
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ListNotificationsParams>,
) -> Result<Json<ListNotificationsResponse>, ErrorReply> {
    match state.engine().matches().get(&id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Err(error_reply(
                StatusCode::NOT_FOUND,
                format!("Match not found: {}", id),
            ))
        }
        Err(e) => return Err(error_reply(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }

    let mut filter = NotificationFilter::new()
        .with_match_id(&id)
        .with_limit(params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT))
        .with_offset(params.offset.unwrap_or(0).max(0));
    if let Some(event_type) = params.event_type {
        filter = filter.with_event_type(event_type);
    }

    let store = state.notification_store();
    let notifications = store
        .query(&filter)
        .map_err(|e| error_reply(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let total = store
        .count(&filter)
        .map_err(|e| error_reply(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    Ok(Json(ListNotificationsResponse {
        notifications,
        total,
    }))
}
