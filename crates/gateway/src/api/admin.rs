//! Health probe.

use axum::response::{IntoResponse, Json};

/// `GET /health` — liveness for load balancers and scripts.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
