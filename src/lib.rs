//! # Duelo - Real-Time 1v1 Olympiad Duels
//!
//! ## Modules
//!
//! - [`handlers`] - HTTP control API (matchmaking, match detail, forfeit)
//! - [`ws`] - Duplex match channel: wire protocol, connection registry, runtime
//! - [`middleware`] - Bearer-token authentication for the control API
//! - [`services`] - Business logic (ELO, matchmaking, answer processing, finalization)
//! - [`models`] - Persistent entities and shared application state
//! - [`config`] - Match runtime tunables

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod ws;

use std::env;
use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use jsonwebtoken::{DecodingKey, EncodingKey};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::config::PvpConfig;
use crate::handlers::{cancel_find, find_match, forfeit_match, get_match_detail, health_check};
use crate::middleware::auth_middleware;
use crate::models::AppState;
use crate::services::jwt::JwtService;
use crate::ws::match_channel;

/// Creates an Axum router with configuration read from the environment.
///
/// # Environment Variables
///
/// - `JWT_SECRET` - Required for bearer-token validation
/// - See [`PvpConfig::from_env`] for the optional match runtime tunables
#[inline]
pub fn app(db_pool: PgPool) -> Router {
    let (router, _) = app_with_config(db_pool, PvpConfig::from_env());
    router
}

/// Creates an Axum router with explicit configuration, returning the
/// shared state alongside so callers can reach the connection registry
/// (e.g. for shutdown or test assertions).
pub fn app_with_config(db_pool: PgPool, config: PvpConfig) -> (Router, Arc<AppState>) {
    let jwt_secret = env::var("JWT_SECRET")
        .expect("Env variable `JWT_SECRET` should be set")
        .into_bytes();
    let jwt_service = JwtService::new(
        EncodingKey::from_secret(&jwt_secret),
        DecodingKey::from_secret(&jwt_secret),
    );

    let state = Arc::new(AppState::new(db_pool, jwt_service, config));

    let control_api = Router::new()
        .route("/api/pvp/find", post(find_match).delete(cancel_find))
        .route("/api/pvp/match/{id}", get(get_match_detail))
        .route("/api/pvp/match/{id}/forfeit", post(forfeit_match))
        .route_layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    let router = Router::new()
        .route("/health-check", get(health_check))
        // The match channel authenticates during admission (query token)
        .route("/api/pvp/ws/{match_id}", get(match_channel))
        .merge(control_api)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    (router, state)
}
