//! Error taxonomy shared by the store, the assignment engine and the HTTP layer.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Result alias used throughout the crate.
pub type AppResult<T> = Result<T, AppError>;

/// Errors surfaced by the coordination core.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed input: a required field is missing or has the wrong shape.
    #[error("{0}")]
    Validation(String),

    /// A referenced incident, report or user does not exist.
    #[error("{0}")]
    NotFound(String),

    /// An assignment or lifecycle invariant would be violated.
    #[error("{0}")]
    Conflict(String),

    /// Missing or invalid credential.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated, but the role does not permit the operation.
    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// HTTP status for this error.
    ///
    /// Conflicts are reported as `400 Bad Request`, matching what clients of
    /// the assignment endpoints already expect.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the caller. Driver details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Storage(_) | Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = json!({
            "status": "error",
            "statusCode": status.as_u16(),
            "msg": self.public_message(),
            "timestamp": Utc::now().to_rfc3339(),
        });

        (status, Json(body)).into_response()
    }
}
