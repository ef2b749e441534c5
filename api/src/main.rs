use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;

mod handlers;
mod routes;
mod state;

use common::bootstrap;
use common::db::PgPoolManager;
use common::scan::HeuristicDetector;
use common::telemetry;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration errors are fatal before anything else starts
    let config = bootstrap::init_settings_and_logging()?;
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        database = ?config.database,
        "Configuration loaded"
    );

    let metrics_handle = telemetry::init_metrics()?;

    // Initialize database connection pool
    let pool = Arc::new(PgPoolManager::new());
    bootstrap::init_pool_manager(&config, &pool)
        .await
        .context("Failed to initialize database pool")?;

    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .context("Invalid server.host")?,
        config.server.port,
    ));

    // Create application state
    let state = AppState::new(
        Arc::clone(&pool),
        Arc::new(HeuristicDetector::new()),
        config,
        metrics_handle,
    );
    let app = routes::create_router(state);

    tracing::info!(addr = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // The listener has drained; close every pooled connection
    pool.shutdown().await;
    telemetry::shutdown_tracer();

    served?;
    tracing::info!("API server stopped");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Initiating graceful shutdown");
}
