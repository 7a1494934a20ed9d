//! # Health Check Handler
//!
//! Liveness endpoint for load balancers and deployment tooling.

use axum::http::StatusCode;
use tracing::instrument;

/// Health check endpoint that returns 200 OK with an empty body.
///
/// GET /health-check
#[instrument]
pub async fn health_check() -> StatusCode {
    StatusCode::OK
}
