//! keel-server: signal ledger HTTP daemon

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use keel_ledger::{Ledger, MaintenanceTask};
use keel_logging::KeelSubscriberBuilder;
use keel_server::{AppState, Args, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ServerConfig::from_args(&args)?;

    let _log_guard = KeelSubscriberBuilder::new()
        .with_config(config.logging.clone())
        .init()
        .context("failed to initialize logging")?;

    info!(
        data_dir = %config.ledger.data_dir.display(),
        listen = %config.listen,
        "Starting keel-server"
    );

    let ledger = Arc::new(
        Ledger::open(config.ledger.clone())
            .await
            .context("failed to open ledger")?,
    );
    let shutdown = CancellationToken::new();

    let maintenance = config.ledger.maintenance.enabled.then(|| {
        MaintenanceTask::spawn(
            Arc::clone(&ledger),
            config.ledger.maintenance.clone(),
            shutdown.child_token(),
        )
    });

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    tokio::spawn(keel_server::cancel_on_signal(
        tokio::signal::ctrl_c(),
        shutdown.clone(),
    ));

    keel_server::serve(listener, AppState::new(ledger, shutdown.clone())).await?;

    shutdown.cancel();
    if let Some(handle) = maintenance {
        if let Err(e) = handle.await {
            error!(error = %e, "Maintenance task panicked");
        }
    }
    info!("keel-server stopped");
    Ok(())
}
