//! Error types for the `envpulse` telemetry pipeline.
//!
//! Domain failures are typed with `thiserror` so callers can branch on them
//! (HTTP status mapping, dead-letter classification). Backend plumbing
//! (sqlx, redis, reqwest) reports through `anyhow::Error`, which is wrapped
//! here at the module boundary.

use serde::Serialize;
use thiserror::Error;

use crate::models::{AlarmAction, AlarmStatus};

// ---

/// A single rejected field of an inbound reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Ingestion-time validation failure. Never enters the event stream.
#[derive(Debug, Clone, Error)]
#[error("invalid reading: {}", summarize(.errors))]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// An operator action that the alarm lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} an alarm that is {from}")]
pub struct TransitionError {
    pub action: AlarmAction,
    pub from: AlarmStatus,
}

/// Main error type shared by the pipeline components.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("cache error: {0:#}")]
    Cache(anyhow::Error),

    #[error("event bus error: {0}")]
    Bus(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("auth service unavailable: {0}")]
    AuthUnavailable(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl PipelineError {
    pub fn storage(err: anyhow::Error) -> Self {
        PipelineError::Storage(err)
    }
}

/// Outcome classification for a consumer that failed to process a record.
///
/// `Poison` records are dead-lettered on the first failure; `Transient`
/// failures are redelivered with backoff until the retry budget runs out.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("poison message: {0}")]
    Poison(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl From<PipelineError> for HandlerError {
    fn from(err: PipelineError) -> Self {
        // ---
        match err {
            PipelineError::Serialization(_) | PipelineError::Validation(_) => {
                HandlerError::Poison(err.to_string())
            }
            other => HandlerError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Poison(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_validation_error_lists_every_field() {
        // ---
        let err = ValidationError {
            errors: vec![
                FieldError::new("site_id", "is required"),
                FieldError::new("humidity", "must be within [0, 100]"),
            ],
        };

        assert_eq!(
            err.to_string(),
            "invalid reading: site_id: is required; humidity: must be within [0, 100]"
        );
    }

    #[test]
    fn test_handler_error_classification() {
        // ---
        let bad_json = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let poison: HandlerError = PipelineError::Serialization(bad_json).into();
        assert!(matches!(poison, HandlerError::Poison(_)));

        let transient: HandlerError =
            PipelineError::storage(anyhow::anyhow!("connection reset")).into();
        assert!(matches!(transient, HandlerError::Transient(_)));
    }
}
