use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use gigroom_shared::protocol::ErrorCode;
use gigroom_shared::{IdError, ProtocolError};
use gigroom_store::StoreError;

/// Failure taxonomy shared by the REST handlers and the realtime gateway.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Malformed frame: {0}")]
    BadFrame(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::Validation(_) => ErrorCode::Validation,
            ServerError::BadFrame(_) => ErrorCode::BadFrame,
            ServerError::Unauthorized(_) => ErrorCode::Unauthorized,
            ServerError::Forbidden(_) => ErrorCode::Forbidden,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            ServerError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the caller may simply try again later.
    pub fn retriable(&self) -> bool {
        matches!(self, ServerError::StoreUnavailable(_))
    }

    /// Message safe to show to a client. Backend details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::StoreUnavailable(_) => "Message store unavailable".to_string(),
            ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(msg) => ServerError::Validation(msg),
            StoreError::NotFound => ServerError::NotFound("message".to_string()),
            other => ServerError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<IdError> for ServerError {
    fn from(e: IdError) -> Self {
        ServerError::Validation(e.to_string())
    }
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        ServerError::BadFrame(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Validation(_) | ServerError::BadFrame(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::StoreUnavailable(_) | ServerError::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({
            "error": self.public_message(),
            "code": self.code(),
            "retriable": self.retriable(),
        });

        (status, axum::Json(body)).into_response()
    }
}
