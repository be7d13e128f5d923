use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::{ApiError, AppState};

// ---

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

pub fn router() -> Router<AppState> {
    Router::new().route("/dead-letters/{topic}", get(list))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

/// Newest dead-lettered records of `topic`, oldest first.
async fn list(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(params): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let bus = state.pipeline.bus();
    if !topic.ends_with("-dlq") || !bus.topics().contains(&topic) {
        return Err(ApiError::not_found(format!("dead-letter topic {topic}")));
    }

    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Ok(Json(bus.read(&topic, limit)))
}
