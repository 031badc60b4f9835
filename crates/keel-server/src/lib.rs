//! # Keel Server
//!
//! HTTP surface over a [`Ledger`]:
//!
//! | route | operation |
//! |-------|-----------|
//! | `POST /ingest` | idempotent ingest (200 accepted, 409 duplicate) |
//! | `GET /partitions?status=&type=` | partition summaries |
//! | `GET /partitions/{date}?type=` | detail, manifest and latest reconciliation |
//! | `GET /partitions/{date}/diff?type=` | ids missing from the downstream |
//! | `POST /partitions/{date}/reconcile?type=` | replay and confirm |
//! | `POST /partitions/{date}/seal` | seal a MAIN partition |
//! | `GET /partitions/{date}/segments?type=` | segment metadata |
//! | `GET /partitions/{date}/segments/{segment}/frames/{index}?type=` | one decoded frame |

pub mod api;
pub mod config;
pub mod error;

pub use config::{Args, ServerConfig};
pub use error::{ServerError, ServerResult};

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use keel_ledger::Ledger;

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    /// Fires when the server begins shutting down
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(ledger: Arc<Ledger>, shutdown: CancellationToken) -> Self {
        Self { ledger, shutdown }
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/ingest", post(api::ingest))
        .route("/partitions", get(api::list_partitions))
        .route("/partitions/{date}", get(api::partition_detail))
        .route("/partitions/{date}/diff", get(api::diff))
        .route("/partitions/{date}/reconcile", post(api::reconcile))
        .route("/partitions/{date}/seal", post(api::seal))
        .route("/partitions/{date}/segments", get(api::segments))
        .route(
            "/partitions/{date}/segments/{segment}/frames/{index}",
            get(api::frame),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API until `shutdown` fires
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    info!(addr = %listener.local_addr()?, "Keel API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Cancel `shutdown` once `signal` fires
///
/// If the listener cannot be installed the server keeps running until it
/// is killed.
pub async fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_failed_signal_listener_keeps_serving() {
        let shutdown = CancellationToken::new();
        let failing = async { Err::<(), _>(std::io::Error::other("no signal handler")) };

        let waited = tokio::time::timeout(
            Duration::from_millis(50),
            cancel_on_signal(failing, shutdown.clone()),
        )
        .await;
        assert!(waited.is_err());
        assert!(!shutdown.is_cancelled());

        cancel_on_signal(async { Ok::<(), std::io::Error>(()) }, shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }
}
