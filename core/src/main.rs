/// Timeline sync session - replays recorded sync responses into a data directory
use std::env;
use std::sync::Arc;
use timeline_sync_core::connectivity::ManualConnectivity;
use timeline_sync_core::transport::{NoHistory, ReplayTransport};
use timeline_sync_core::{Config, Session};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let fixture = config
        .fixture
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No sync source: pass --fixture <responses.json>"))?;
    let transport = ReplayTransport::from_file(&fixture)
        .map_err(|e| anyhow::anyhow!("Failed to load fixture {:?}: {}", fixture, e))?;

    let session = Session::open(
        &config,
        Arc::new(transport),
        Arc::new(NoHistory),
        Arc::new(ManualConnectivity::default()),
    )
    .map_err(|e| anyhow::anyhow!("Failed to open session: {}", e))?;

    info!("Starting timeline sync");
    info!("   Data dir: {:?}", config.data_dir);
    info!("   Fixture: {:?}", fixture);
    session.start_syncing();

    wait_for_shutdown().await;
    info!("Shutdown signal received, stopping sync...");
    session.shutdown().await;

    match session.sync_cursor() {
        Ok(cursor) => info!("Stopped at cursor {:?}", cursor),
        Err(e) => warn!("Could not read sync cursor: {}", e),
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
