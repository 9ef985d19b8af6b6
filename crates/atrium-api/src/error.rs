//! API error types and JSON error response formatting.
//!
//! ApiError provides a consistent JSON error response format across all
//! endpoints, mapping internal errors to appropriate HTTP status codes.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use atrium_booking::AllocationError;
use atrium_core::error::AtriumError;
use atrium_queue::QueueError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured details about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid parameters.
    BadRequest(String),
    /// 404 Not Found - resource does not exist.
    NotFound(String),
    /// 409 Conflict - the requested slot range is taken.
    Conflict(String),
    /// 422 Unprocessable Entity - valid syntax but semantic validation failure.
    UnprocessableEntity(String),
    /// 429 Too Many Requests - backpressure; retry after the given seconds.
    TooManyRequests { message: String, retry_after_secs: u64 },
    /// 500 Internal Server Error - unexpected server error.
    Internal(String),
    /// 503 Service Unavailable - shutting down or component not ready.
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut retry_after = None;
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::UnprocessableEntity(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity", msg)
            }
            ApiError::TooManyRequests {
                message,
                retry_after_secs,
            } => {
                retry_after = Some(retry_after_secs);
                (StatusCode::TOO_MANY_REQUESTS, "too_many_requests", message)
            }
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
            details: None,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<AtriumError> for ApiError {
    fn from(err: AtriumError) -> Self {
        match &err {
            AtriumError::Config(msg) | AtriumError::InvalidInput(msg) => {
                ApiError::BadRequest(msg.clone())
            }
            AtriumError::UnknownProject(id) => ApiError::NotFound(format!("Unknown project: {}", id)),
            AtriumError::ShuttingDown => ApiError::ServiceUnavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<AllocationError> for ApiError {
    fn from(err: AllocationError) -> Self {
        match &err {
            AllocationError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            AllocationError::NotFound(_) => ApiError::NotFound(err.to_string()),
            AllocationError::UnknownSpecialist(_)
            | AllocationError::OutsideWorkingHours { .. }
            | AllocationError::OffGrid(_)
            | AllocationError::InvalidDuration(_) => ApiError::UnprocessableEntity(err.to_string()),
            AllocationError::Storage(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl ApiError {
    /// Queue errors, with `retry_after_secs` used for backpressure.
    pub fn from_queue(err: QueueError, retry_after_secs: u64) -> Self {
        match err {
            QueueError::QueueFull { .. } => ApiError::TooManyRequests {
                message: err.to_string(),
                retry_after_secs,
            },
            QueueError::Closed => ApiError::ServiceUnavailable(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
