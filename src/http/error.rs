//! Route-boundary error conversion.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::client::ClientError;

/// Error text returned to the caller with a status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Scenario routes report every client failure as a 400 with its text.
    pub fn from_client(e: &ClientError) -> Self {
        Self::bad_request(e.to_string())
    }

    /// Status API mapping: missing instances are 404, finished ones 410.
    pub fn from_client_rest(e: &ClientError) -> Self {
        let status = match e {
            ClientError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            ClientError::InvalidState(_) => StatusCode::GONE,
            ClientError::AlreadyExists(_) => StatusCode::CONFLICT,
            ClientError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ClientError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ClientError::Provider(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(target: "durable_e2e::http", status = %self.status, error = %self.message, "Request failed");
        }
        (self.status, self.message).into_response()
    }
}
