//! Standardized API error responses for Keyseat endpoints.
//!
//! Denials of a license check are NOT errors and never use this type; they
//! travel in the normal check response with `granted: false`. This module
//! covers malformed requests and unknown sessions on keep-alive.
//!
//! # Response Format
//!
//! ```json
//! {
//!   "error": {
//!     "code": "INVALID_FIELD",
//!     "message": "Invalid value for 'license_key': cannot be empty",
//!     "details": { "field": "license_key" }
//!   }
//! }
//! ```

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::server::validation::ValidationError;

/// Machine-readable error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // === Validation Errors (400) ===
    /// Request payload is invalid or malformed
    InvalidRequest,
    /// A field value is invalid
    InvalidField,

    // === Resource Errors (404) ===
    /// Session is unknown, closed or expired
    SessionNotFound,
}

impl ErrorCode {
    /// Returns the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest | ErrorCode::InvalidField => StatusCode::BAD_REQUEST,
            ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Returns a default human-readable message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "Request payload is invalid",
            ErrorCode::InvalidField => "A field value is invalid",
            ErrorCode::SessionNotFound => "Session not found",
        }
    }
}

/// The inner error object containing code, message, and optional details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details (field name, constraint violated, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Standardized API error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// The error details
    pub error: ErrorBody,
}

impl ApiError {
    /// Creates a new API error with the default message for `code`.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: code.default_message().to_string(),
                details: None,
            },
        }
    }

    /// Creates a new API error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                details: None,
            },
        }
    }

    /// Creates a new API error with a custom message and details.
    pub fn with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                details: Some(details),
            },
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.error.code.status_code()
    }

    /// Invalid request error with field details.
    pub fn invalid_field(field: &str, reason: &str) -> Self {
        Self::with_details(
            ErrorCode::InvalidField,
            format!("Invalid value for '{}': {}", field, reason),
            serde_json::json!({ "field": field }),
        )
    }

    pub fn session_not_found() -> Self {
        Self::new(ErrorCode::SessionNotFound)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}",
            self.error.code.default_message(),
            self.error.message
        )
    }
}

impl std::error::Error for ApiError {}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::invalid_field(&err.field, &err.message)
    }
}

/// Unreadable bodies (bad JSON, missing fields, wrong content type) get the
/// same envelope as every other client error.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!(status = %rejection.status(), "Rejected request body: {}", rejection.body_text());
        ApiError::with_message(ErrorCode::InvalidRequest, rejection.body_text())
    }
}
