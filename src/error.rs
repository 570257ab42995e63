use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::auth::AuthError;
use crate::llm::ModelError;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: i32,
    pub message: String,
    pub http_status: u16,
}

/// Every failure a handler can surface to a caller. Persistence failures
/// never reach this type; the recorder absorbs them.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(AuthError),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Configuration(String),
    #[error("Model call failed")]
    ModelCallFailed,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ModelCallFailed => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_code(&self) -> i32 {
        match self {
            ApiError::Unauthorized(_) => 2001,
            ApiError::PayloadTooLarge(_) => 4001,
            ApiError::InvalidRequest(_) => 4002,
            ApiError::Configuration(_) => 5001,
            ApiError::ModelCallFailed => 5021,
        }
    }

    pub fn to_response_body(&self) -> ErrorResponse {
        ErrorResponse {
            error_code: self.error_code(),
            message: self.to_string(),
            http_status: self.status().as_u16(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Unauthorized(err)
    }
}

impl From<ModelError> for ApiError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::NotConfigured => {
                ApiError::Configuration("Model provider not configured".into())
            }
            // Upstream detail has already been logged by the client.
            ModelError::Status { .. } | ModelError::Transport(_) | ModelError::Envelope(_) => {
                ApiError::ModelCallFailed
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_response_body())).into_response()
    }
}
