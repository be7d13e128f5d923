// src/routes/health.rs
//! API health check endpoint.
//!
//! `/health` is used by container orchestrators and CI to verify that the
//! service responds. Besides liveness it reports the pipeline status: per
//! consumer group lag and counters, dead-letter sizes and live subscribers.
//! It never touches the database or cache.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::PipelineStatus;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    pipeline: PipelineStatus,
}

/// Handle `GET /health`.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    // ---
    let status = if state.pipeline.is_running() {
        "ok"
    } else {
        "stopping"
    };
    Json(HealthResponse {
        status,
        pipeline: state.pipeline.status(),
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
