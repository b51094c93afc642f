//! # Error Handling
//!
//! Custom error types for the HTTP surface and how they convert to JSON
//! responses. Provider-level failures never reach this module: the adapter
//! chains convert them to fallback behavior at the adapter boundary, and
//! only unrecoverable setup failures surface as errors at all.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "bad_request",
//!     "message": "text is required",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Application error categories, mapped to HTTP status codes.
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (500)
    Internal(String),

    /// Client sent invalid or malformed data (400)
    BadRequest(String),

    /// Requested resource doesn't exist (404)
    NotFound(String),

    /// Configuration file or environment variable problems (500)
    ConfigError(String),

    /// User input failed validation rules (400)
    ValidationError(String),

    /// An upstream provider call failed in a request-scoped context (502)
    ProviderError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ProviderError(msg) => write!(f, "Provider error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::ProviderError(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "provider_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ProviderError(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            AppError::BadRequest("x".into()).error_response().status(),
            actix_web::http::StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Internal("x".into()).error_response().status(),
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::ProviderError("x".into()).error_response().status(),
            actix_web::http::StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_display_format() {
        let err = AppError::ValidationError("text is required".into());
        assert_eq!(err.to_string(), "Validation error: text is required");
    }
}
