use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{handlers, matches, middleware::metrics_middleware, reconciler, webhooks};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // API routes
    let api_routes = Router::<Arc<AppState>>::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        // Reconciler
        .route("/reconciler/status", get(reconciler::get_status))
        .route("/reconciler/tick", post(reconciler::tick))
        // Matches
        .route("/matches", post(matches::create_match))
        .route("/matches", get(matches::list_matches))
        .route("/matches/{id}", get(matches::get_match))
        .route("/matches/{id}/link", post(matches::submit_link))
        .route("/matches/{id}/analysis", post(matches::request_analysis))
        .route("/matches/{id}/stages/{stage}", post(matches::submit_stage))
        .route("/matches/{id}/notifications", get(matches::list_notifications))
        // Webhooks
        .route("/webhooks/ingestion", post(webhooks::ingestion));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
}
