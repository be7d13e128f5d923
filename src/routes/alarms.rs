//! Operator actions on raised alarms.
//!
//! Every action requires `Authorization: Bearer <token>`, validated against
//! the auth collaborator. The body is optional; when present it may carry a
//! `remark` recorded on the alarm.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::put,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::{AlarmAction, FieldError, OperatorContext, PipelineError, ValidationError};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/alarms/{id}/confirm", put(confirm))
        .route("/alarms/{id}/resolve", put(resolve))
        .route("/alarms/{id}/ignore", put(ignore))
}

#[derive(Debug, Default, Deserialize)]
struct ActionBody {
    #[serde(default)]
    remark: Option<String>,
}

async fn confirm(
    state: State<AppState>,
    id: Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    act(state, id, headers, body, AlarmAction::Confirm).await
}

async fn resolve(
    state: State<AppState>,
    id: Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    act(state, id, headers, body, AlarmAction::Resolve).await
}

async fn ignore(
    state: State<AppState>,
    id: Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    act(state, id, headers, body, AlarmAction::Ignore).await
}

async fn act(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
    action: AlarmAction,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let operator = authenticate(&state, &headers).await?;
    let body = parse_body(&body)?;

    let alarm = state
        .pipeline
        .alarm_actions()
        .apply(id, action, &operator, body.remark)
        .await?;
    Ok(Json(alarm))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<OperatorContext, ApiError> {
    // ---
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    Ok(state.validator.validate(token).await?)
}

fn parse_body(body: &Bytes) -> Result<ActionBody, ApiError> {
    // ---
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ActionBody::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        ApiError::from(PipelineError::from(ValidationError {
            errors: vec![FieldError::new("body", e.to_string())],
        }))
    })
}
