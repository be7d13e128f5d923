use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use super::{ApiError, AppState};
use crate::{RawReading, SiteId};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/readings", post(submit))
        .route("/readings/batch", post(submit_batch))
        .route("/readings/{site_id}/latest", get(latest))
        .route("/readings/{site_id}/history", get(history))
}

/// `202 Accepted`: the reading is on the bus, not necessarily stored yet.
async fn submit(
    State(state): State<AppState>,
    Json(raw): Json<RawReading>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let ack = state.pipeline.producer().submit(raw).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn submit_batch(
    State(state): State<AppState>,
    Json(batch): Json<Vec<RawReading>>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    info!("POST /readings/batch - {} readings", batch.len());
    let acks = state.pipeline.producer().submit_batch(batch).await?;
    Ok((StatusCode::ACCEPTED, Json(acks)))
}

async fn latest(
    State(state): State<AppState>,
    Path(site_id): Path<SiteId>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    match state.pipeline.cache().get_latest(site_id).await? {
        Some(reading) => Ok(Json(reading)),
        None => Err(ApiError::not_found(format!("reading for site {site_id}"))),
    }
}

/// Query parameters of the history window.
///
/// `to` defaults to now and `from` to the start of `to`'s UTC day.
#[derive(Debug, Deserialize)]
struct HistoryQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn history(
    State(state): State<AppState>,
    Path(site_id): Path<SiteId>,
    Query(params): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let to = params.to.unwrap_or_else(Utc::now);
    let from = params
        .from
        .or_else(|| to.date_naive().and_hms_opt(0, 0, 0).map(|t| t.and_utc()))
        .unwrap_or(to);
    debug!(site_id, %from, %to, "GET /readings/history");

    let window = state.pipeline.cache().get_window(site_id, from, to).await?;
    Ok(Json(window))
}
