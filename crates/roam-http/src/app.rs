use axum::routing::{any, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        // Liveness
        .route("/healthz", get(handlers::health))
        // Offload / onload / confirm, target selection, status push
        .route("/internode", post(handlers::internode))
        // The session-carrying application surface
        .route("/app", any(handlers::app_entry))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
