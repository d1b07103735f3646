//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tether_core::webhook::RouteError;

use super::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// No credential was presented.
    Unauthorized(String),
    /// A credential was presented and rejected.
    Forbidden(String),
    /// The request body could not be understood.
    Validation(String),
    /// Generic internal error.
    Internal(String),
}

impl From<RouteError> for AppError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::Authentication(inner) if inner.is_missing() => {
                AppError::Unauthorized(inner.to_string())
            }
            RouteError::Authentication(inner) => AppError::Forbidden(inner.to_string()),
            RouteError::Parse(inner) => AppError::Validation(inner.to_string()),
            other => {
                tracing::error!(error = %other, "delivery processing failed");
                AppError::Internal(other.to_string())
            }
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        ApiResponse::error(code, message, uuid::Uuid::now_v7().to_string(), 0)
            .into_response_with(status)
    }
}
