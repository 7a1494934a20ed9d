//! # Duelo Application Entry Point
//!
//! ## Environment Variables
//!
//! - `DATABASE_URL` - PostgreSQL connection string (required)
//! - `ADDRESS` - Server bind address (required)
//! - `JWT_SECRET` - Bearer-token signing secret (required)
//! - `POSTGRES_POOL_SIZE` - Connection pool size (optional, defaults to 20)
//! - `RUST_LOG` - Logging level (optional, defaults to `info`)
//! - `LOG_FORMAT` - Log format, either `json` or `plain` (optional, defaults to `plain`)

use std::env;

use duelo::app_with_config;
use duelo::config::PvpConfig;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::{info, instrument};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
#[instrument]
async fn main() {
    dotenvy::dotenv().ok(); // doesn't override existing env vars

    // 1. Set up tracing subscriber for logging
    init_tracing();

    // 2. Connect to PostgreSQL and apply pending migrations
    let pool_size = env::var("POSTGRES_POOL_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);
    let db_pool = PgPoolOptions::new()
        .max_connections(pool_size)
        .connect(&env::var("DATABASE_URL").expect("Env variable `DATABASE_URL` should be set"))
        .await
        .expect("Failed to connect to Postgres");
    info!("Connected to PostgreSQL database");

    sqlx::migrate!()
        .run(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let (app, state) = app_with_config(db_pool, PvpConfig::from_env());

    // 3. Start server at specified address
    let addr = env::var("ADDRESS").expect("Env variable `ADDRESS` should be set");
    let listener = TcpListener::bind(&addr).await.unwrap();
    info!("Server starting at http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    // Close every live connection and cancel all disconnect timers before
    // the process exits.
    state.registry.shutdown().await;
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Shutdown signal received");
}

/// Initialize tracing with environment-based configuration
///
/// Supports both structured JSON logging and human-readable console output
/// based on environment variables.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    let format_layer = match env::var("LOG_FORMAT").as_deref() {
        Ok("json") => {
            let formatting_layer = tracing_bunyan_formatter::BunyanFormattingLayer::new(
                "duelo".into(),
                std::io::stdout,
            );
            Box::new(formatting_layer) as Box<dyn tracing_subscriber::Layer<_> + Send + Sync>
        }
        _ => {
            let formatting_layer = tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(false);
            Box::new(formatting_layer) as Box<dyn tracing_subscriber::Layer<_> + Send + Sync>
        }
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(format_layer)
        .init();

    info!("Tracing initialized");
}
