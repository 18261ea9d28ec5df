pub mod admin;
pub mod agent;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/agents", get(agent::list_agents))
        .route("/agent/:name", post(agent::post_message))
        .route("/agent/:name/events", get(agent::events_sse))
        .route("/agent/:name/state", get(agent::get_state))
        .route("/agent/:name/log", get(agent::get_log))
        .route("/agent/:name/interrupt", post(agent::interrupt))
        .route("/agent/:name/end", post(agent::end_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
