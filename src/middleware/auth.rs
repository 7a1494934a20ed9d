//! # Authentication Middleware
//!
//! Validates bearer tokens on the control API and hands the verified
//! user id to downstream handlers. Token issuance is the external auth
//! service's job; this middleware only checks signature and expiry.
//! The match channel performs the same check itself during admission,
//! since browsers cannot attach headers to websocket upgrades.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::models::AppState;
use crate::services::jwt::Claims;

/// Middleware protecting the PvP control routes.
///
/// Extracts `Authorization: Bearer <token>`, validates it and inserts an
/// [`AuthUser`] into the request extensions. Anything less than a valid,
/// unexpired token is a `401 Unauthorized`.
#[instrument(
    skip_all,
    fields(
        method = %req.method(),
        uri = %req.uri(),
        request_id = %uuid::Uuid::new_v4()
    )
)]
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    let Some(auth_header) = auth_header else {
        warn!("Missing Authorization header");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(token) = auth_header.strip_prefix("Bearer ") else {
        warn!("Invalid Authorization header format");
        return Err(StatusCode::UNAUTHORIZED);
    };

    match state.jwt_service.validate_access_token(token) {
        Ok(claims) => {
            let user_id = Uuid::try_parse(&claims.sub).map_err(|e| {
                warn!(error = %e, "Failed to parse user ID from token claims");
                StatusCode::UNAUTHORIZED
            })?;

            debug!(%user_id, "Authentication successful");
            req.extensions_mut().insert(AuthUser { user_id, claims });
            Ok(next.run(req).await)
        }
        Err(e) => {
            warn!(error = %e, "Token validation failed");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Authenticated user context, inserted into request extensions by
/// [`auth_middleware`] and extracted by handlers via `Extension<AuthUser>`.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// Unique identifier for the authenticated user
    pub user_id: Uuid,
    /// JWT claims containing additional token metadata
    pub claims: Claims,
}
