use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

use crate::config::PvpConfig;
use crate::services::jwt::JwtService;
use crate::ws::ConnectionRegistry;

/// Application state shared across requests. Needs to be thread-safe.
pub struct AppState {
    /// The PostgreSQL database connection pool.
    pub db_pool: PgPool,
    /// JWT service for bearer-token validation.
    pub jwt_service: JwtService,
    /// In-process registry of live match-channel connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Match runtime tunables.
    pub config: PvpConfig,
}

impl AppState {
    pub fn new(db_pool: PgPool, jwt_service: JwtService, config: PvpConfig) -> Self {
        info!("Initializing application state");

        Self {
            db_pool,
            jwt_service,
            registry: Arc::new(ConnectionRegistry::new(config.clone())),
            config,
        }
    }
}
