//! Error types for the manager and its API responses

use crate::model::ModelIdentity;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by lifecycle operations
#[derive(Debug, Error)]
pub enum NimError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Command `{command}` failed (exit code {code:?}): {stderr}")]
    RuntimeCommand {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to execute `{command}`: {source}")]
    RuntimeUnavailable {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("NIM {0} is not running")]
    NotRunning(ModelIdentity),

    #[error("No free port found after {attempts} attempts starting at {start}")]
    PortsExhausted { start: u16, attempts: u16 },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Invalid inference request: {0}")]
    InvalidRequest(String),

    #[error("Inference request failed: {0}")]
    Inference(String),

    #[error("NIM {model} did not become ready within {timeout_secs}s")]
    ReadyTimeout {
        model: ModelIdentity,
        timeout_secs: u64,
    },
}

pub type NimResult<T> = Result<T, NimError>;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

impl From<NimError> for ApiError {
    fn from(err: NimError) -> Self {
        match err {
            NimError::NotRunning(_) => ApiError::NotFound(err.to_string()),
            NimError::UnknownModel(_) | NimError::InvalidRequest(_) => {
                ApiError::BadRequest(err.to_string())
            }
            NimError::RuntimeCommand { .. }
            | NimError::RuntimeUnavailable { .. }
            | NimError::Inference(_) => ApiError::BadGateway(err.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
