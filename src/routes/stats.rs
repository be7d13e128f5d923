use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;

use super::{ApiError, AppState};
use crate::SiteId;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/stats/{site_id}/{date}", get(daily))
}

/// `GET /stats/{site_id}/{date}` with `date` as `YYYY-MM-DD` (UTC day).
async fn daily(
    State(state): State<AppState>,
    Path((site_id, date)): Path<(SiteId, NaiveDate)>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    match state.pipeline.statistics().get(site_id, date).await? {
        Some(aggregate) => Ok(Json(aggregate)),
        None => Err(ApiError::not_found(format!(
            "daily statistics for site {site_id} on {date}"
        ))),
    }
}
