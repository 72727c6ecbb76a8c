//! API error types and HTTP status mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::client::ClientError;
use crate::dispatcher::DispatcherError;
use crate::storage::StorageError;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Request conflicts with the resource's state.
    Conflict(String),
    /// Request is well-formed but invalid (bad cron, unknown handler).
    Unprocessable(String),
    /// Service unavailable (e.g., dispatcher stopped).
    ServiceUnavailable(String),
    /// Internal server error.
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Unprocessable(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_REQUEST"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let message = match self {
            ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::Unprocessable(msg)
            | ApiError::ServiceUnavailable(msg)
            | ApiError::Internal(msg) => msg,
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound(msg) => ApiError::NotFound(msg),
            ClientError::Conflict(msg) => ApiError::Conflict(msg),
            ClientError::InvalidExpression(msg) | ClientError::InvalidDelay(msg) => {
                ApiError::Unprocessable(msg)
            }
            ClientError::Storage(e) => e.into(),
        }
    }
}

impl From<DispatcherError> for ApiError {
    fn from(err: DispatcherError) -> Self {
        match err {
            DispatcherError::Storage(e) => e.into(),
            DispatcherError::ChannelError(_) => {
                ApiError::ServiceUnavailable("dispatcher is not running".to_string())
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => ApiError::NotFound(msg),
            StorageError::Conflict(msg) | StorageError::DuplicateKey(msg) => {
                ApiError::Conflict(msg)
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
