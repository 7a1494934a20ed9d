//! # Centralized Error Handling
//!
//! Unified error type for the whole application. HTTP handlers return
//! [`AppResult`] and rely on the [`IntoResponse`] impl for status mapping;
//! the websocket runtime maps the same variants onto `error` events instead
//! (see [`crate::ws`]).

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Central application error type that encompasses all possible error conditions.
///
/// Storage errors are logged automatically when converted into a response;
/// other variants should be logged at the point of creation if needed.
#[derive(Error, Debug)]
pub enum AppError {
    /// Storage failure (timeouts, lock acquisition, connection loss).
    /// Callers may retry.
    #[error("database error")]
    Db(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    /// A second live connection for the same (match, user), or a
    /// storage-level uniqueness conflict.
    #[error("conflict: {0}")]
    Conflict(&'static str),

    /// Operation incompatible with the current match status, e.g.
    /// finalizing a waiting match or answering a finished one.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Answer submissions are capped at one per second per (match, user).
    #[error("rate limited, retry in {wait_seconds:.1}s")]
    RateLimited { wait_seconds: f64 },

    #[error("internal server error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Db(e) = &self {
            error!(?e, "Database error occurred");
        }

        let (status, message) = match self {
            AppError::Db(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.to_string()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.to_string()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.to_string()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.to_string()),
            AppError::InvalidState(msg) => (StatusCode::BAD_REQUEST, msg.to_string()),
            AppError::RateLimited { wait_seconds } => (
                StatusCode::TOO_MANY_REQUESTS,
                format!("Rate limit exceeded, retry in {wait_seconds:.1}s"),
            ),
            AppError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(ErrorBody { message });
        (status, body).into_response()
    }
}

/// Convenience Result type alias that uses AppError as the error type.
pub type AppResult<T> = Result<T, AppError>;
