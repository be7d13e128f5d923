//! HTTP and WebSocket surface.
//!
//! Each sibling module exports a subrouter over [`AppState`]; this gateway
//! merges them and attaches the state, so `main.rs` never sees individual
//! endpoints. Handlers stay thin: they translate requests into pipeline
//! operations and map [`PipelineError`] to status codes through [`ApiError`].

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use crate::{Pipeline, PipelineError, TokenValidator};

mod alarms;
mod dead_letters;
mod health;
mod live;
mod readings;
mod stats;

// ---

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub validator: Arc<dyn TokenValidator>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            pipeline,
            validator,
        }
    }
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(stats::router())
        .merge(alarms::router())
        .merge(dead_letters::router())
        .merge(live::router())
        .merge(health::router())
        .with_state(state)
}

/// Error response: `{"error": "..."}` plus field details for validation.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ApiError(PipelineError::NotFound(what.into()))
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        ApiError(PipelineError::Unauthorized(reason.into()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        let status = match &self.0 {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Transition(_) | PipelineError::Conflict(_) => StatusCode::CONFLICT,
            PipelineError::AuthUnavailable(_) | PipelineError::Bus(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PipelineError::Serialization(_)
            | PipelineError::Storage(_)
            | PipelineError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("{} -> {}", self.0, status);
        }

        let body = match &self.0 {
            PipelineError::Validation(v) => json!({ "error": self.0.to_string(), "fields": v.errors }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
