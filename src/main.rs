//! pg_cache maintenance node
//!
//! Ensures the cache table exists, takes part in manager election and runs
//! expired-entry cleanup until shut down.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pg_cache::datasource::{mask_connection_string, DataSource};
use pg_cache::infrastructure::SchemaManager;
use pg_cache::time::{SharedClock, SystemClock};
use pg_cache::{CacheOptions, CleanupService, ManagerElection, PgDataSource};

/// Main entry point for the maintenance node.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Create the PostgreSQL data source
/// 4. Ensure the cache table exists
/// 5. Start manager election and the cleanup timer
/// 6. Stop both and close the pool on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pg_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting pg_cache maintenance node");

    let options = CacheOptions::from_env();
    options.validate().context("invalid cache configuration")?;
    info!(
        connection = %mask_connection_string(&options.connection_string, &options.sensitive_parameters),
        table = %options.target,
        cleanup_interval = ?options.cleanup_interval,
        election = options.enable_manager_election,
        "Configuration loaded"
    );

    let pg = Arc::new(PgDataSource::connect_lazy(&options).context("failed to create connection pool")?);
    let source: Arc<dyn DataSource> = pg.clone();
    let clock: SharedClock = Arc::new(SystemClock);

    let outcome = SchemaManager::new(&options, Arc::clone(&source))
        .ensure()
        .await
        .context("failed to ensure cache infrastructure")?;
    info!(?outcome, "Cache infrastructure ready");

    let election = Arc::new(ManagerElection::new(&options, Arc::clone(&source), clock.clone()));
    election.start();

    let cleanup = Arc::new(CleanupService::new(
        &options,
        Arc::clone(&source),
        Some(Arc::clone(&election)),
        clock,
    ));
    cleanup.start();

    shutdown_signal().await?;

    cleanup.stop().await;
    election.stop().await;
    pg.close().await;

    info!("Maintenance node shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        }
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
    Ok(())
}
