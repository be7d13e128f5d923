//! Token validation against the external auth collaborator.
//!
//! Only operator alarm actions need an identity. The validated
//! [`OperatorContext`] is passed explicitly to the code that records who did
//! what; nothing is stored in ambient per-request state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::PipelineError;

// ---

/// Identity of the operator performing an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorContext {
    pub user_id: i64,
    pub username: String,
    pub role: String,
}

#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    /// Resolve `token` into an operator. Invalid tokens yield
    /// [`PipelineError::Unauthorized`]; an unreachable collaborator yields
    /// [`PipelineError::AuthUnavailable`].
    async fn validate(&self, token: &str) -> Result<OperatorContext, PipelineError>;
}

/// Response envelope of `POST {base}/auth/validate?token=...`.
#[derive(Debug, Deserialize)]
struct ValidateResponse {
    code: i32,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<ValidatedUser>,
}

#[derive(Debug, Deserialize)]
struct ValidatedUser {
    id: i64,
    username: String,
    #[serde(default)]
    role: Option<String>,
}

pub struct HttpTokenValidator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenValidator {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TokenValidator for HttpTokenValidator {
    async fn validate(&self, token: &str) -> Result<OperatorContext, PipelineError> {
        // ---
        let url = format!("{}/auth/validate", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| {
                warn!("auth service request failed: {e}");
                PipelineError::AuthUnavailable(e.to_string())
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PipelineError::Unauthorized("token rejected".into()));
        }
        if !status.is_success() {
            return Err(PipelineError::AuthUnavailable(format!(
                "auth service answered {status}"
            )));
        }

        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::AuthUnavailable(format!("bad auth response: {e}")))?;

        match body {
            ValidateResponse {
                code: 200,
                data: Some(user),
                ..
            } => {
                debug!(user_id = user.id, "token validated");
                Ok(OperatorContext {
                    user_id: user.id,
                    username: user.username,
                    role: user.role.unwrap_or_else(|| "USER".to_string()),
                })
            }
            ValidateResponse { message, .. } => Err(PipelineError::Unauthorized(
                message.unwrap_or_else(|| "invalid token".to_string()),
            )),
        }
    }
}

/// Used when no auth collaborator is configured: every action is refused.
pub struct UnavailableValidator;

#[async_trait]
impl TokenValidator for UnavailableValidator {
    async fn validate(&self, _token: &str) -> Result<OperatorContext, PipelineError> {
        Err(PipelineError::AuthUnavailable(
            "no auth service configured".into(),
        ))
    }
}
