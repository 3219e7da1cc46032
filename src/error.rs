use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::ratelimit::AdmissionError;

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Admission Errors
///
/// Errors from the admission subsystem keep their own taxonomy and are
/// mapped here:
///
/// - `InvalidIdentity` → 400 `IP_DETECTION_FAILED`
/// - store unreachable, closed or full → 503 `RATE_LIMIT_ERROR`
/// - any other store failure → 500 `RATE_LIMIT_ERROR`
/// - `RateLimitExceeded` → 429 (the middleware normally renders this itself)
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("File exceeds maximum size of {max} bytes")]
    PayloadTooLarge { max: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Admission check failed: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    message: String,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Admission(err) => admission_status(err),
            AppError::Storage(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn admission_status(err: &AdmissionError) -> StatusCode {
    match err {
        AdmissionError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        AdmissionError::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
        AdmissionError::StoreCapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Log the full error server-side, expose only sanitized messages
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let (error_type, code, message) = match &self {
            AppError::NotFound(msg) => ("not_found", None, msg.clone()),
            AppError::BadRequest(msg) => ("bad_request", None, msg.clone()),
            AppError::PayloadTooLarge { .. } => ("payload_too_large", None, self.to_string()),
            AppError::Storage(_) => (
                "storage_error",
                None,
                "File storage failed. Please try again.".to_string(),
            ),
            AppError::ConfigError(_) => (
                "internal_error",
                None,
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string(),
            ),
            AppError::Admission(err) => match err {
                AdmissionError::RateLimitExceeded { error, .. } => (
                    "Rate limit exceeded",
                    Some("RATE_LIMIT_EXCEEDED"),
                    error.message.clone(),
                ),
                AdmissionError::InvalidIdentity(_) => (
                    "Unable to determine client IP",
                    Some("IP_DETECTION_FAILED"),
                    "Your client address could not be determined.".to_string(),
                ),
                _ if status == StatusCode::SERVICE_UNAVAILABLE => (
                    "Rate limiting unavailable",
                    Some("RATE_LIMIT_ERROR"),
                    "Upload admission is temporarily unavailable. Please try again later."
                        .to_string(),
                ),
                _ => (
                    "Rate limiting failed",
                    Some("RATE_LIMIT_ERROR"),
                    "Upload admission failed. Please try again.".to_string(),
                ),
            },
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            code,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
