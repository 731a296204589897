//! Error types for the HTTP layer.
//!
//! `ApiError` maps request-path refusals to status codes and JSON bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Body text returned to clients that exceeded their quota.
pub const REQUEST_REFUSED: &str = "request refused";

/// HTTP-facing error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Client exceeded its request quota.
    #[error("too many requests")]
    TooManyRequests,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub(crate) error: String,
    /// Human-readable error detail, if available.
    pub(crate) detail: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            ApiError::TooManyRequests => (
                StatusCode::TOO_MANY_REQUESTS,
                "too_many_requests",
                Some(REQUEST_REFUSED.to_string()),
            ),
        };

        let body = ErrorBody {
            error: error.to_string(),
            detail,
        };

        (status, axum::Json(body)).into_response()
    }
}
