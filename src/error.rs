use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

// Failures of the shared key-value store. Callers recover from all of these
// locally (fail open / no-op), they never reach an end user.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("wrong value type at {0}")]
    WrongType(String),
}

/// Errors returned by the compute control plane.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlPlaneError {
    /// Timeouts, throttling, 5xx. Surfaced as "still in progress" or as a
    /// retryable error, never retried internally.
    #[error("transient control plane error: {0}")]
    Transient(String),

    /// Invalid instance id, permission denied. Fatal for the invocation.
    #[error("control plane rejected request ({code}): {message}")]
    Permanent { code: String, message: String },
}

impl ControlPlaneError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlPlaneError::Transient(_))
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        ControlPlaneError::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error("unknown action: {0}")]
    UnknownAction(String),
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ControlError::UnknownAction(action) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "status": "error",
                    "message": format!("unknown action: {action}"),
                }),
            ),
            ControlError::ControlPlane(ControlPlaneError::Transient(message)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "error",
                    "retryable": true,
                    "message": message,
                }),
            ),
            ControlError::ControlPlane(ControlPlaneError::Permanent { code, message }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({
                    "status": "error",
                    "error_code": code,
                    "message": message,
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}
