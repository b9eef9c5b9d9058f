//! Rollcall API Server

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use rollcall_api::{AppState, routes};
use rollcall_config::{SystemConfig, load_system_config};
use rollcall_db::{PgSettingsRepo, create_pool, run_migrations};
use rollcall_scheduler::effective_limits;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // The broker is mandatory; the record store defaults to the same database.
    let broker_url = std::env::var("ROLLCALL_BROKER_URL")
        .context("ROLLCALL_BROKER_URL must be set to the queue broker database")?;
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| broker_url.clone());

    let mut config = match std::env::var("ROLLCALL_CONFIG") {
        Ok(path) => {
            let path = PathBuf::from(path);
            info!(path = %path.display(), "Loading system configuration");
            load_system_config(&path)?
        }
        Err(_) => SystemConfig::new(),
    };

    info!("Connecting to database...");
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;
    let broker_pool = if database_url == broker_url {
        pool.clone()
    } else {
        let broker_pool = create_pool(&broker_url).await?;
        run_migrations(&broker_pool).await?;
        broker_pool
    };
    info!("Database connected");

    config.workers = effective_limits(&PgSettingsRepo::new(pool.clone()), config.workers).await;
    config.workers.validate()?;

    let state = AppState::postgres(pool, broker_pool, config);
    state.runtime.start().await?;

    // Build router
    let app = routes::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr: SocketAddr = std::env::var("ROLLCALL_BIND")
        .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
        .parse()
        .context("ROLLCALL_BIND must be a socket address")?;
    info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.runtime.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
