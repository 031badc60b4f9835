//! Background maintenance task
//!
//! Seals MAIN partitions once their day is over and, optionally,
//! reconciles them straight away. Runs on a fixed interval until the
//! cancellation token fires.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use keel_core::PartitionKey;
use keel_storage::ReconcileResult;

use crate::config::MaintenanceConfig;
use crate::{Ledger, LedgerResult};

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    /// Partitions sealed during the pass
    pub sealed: Vec<PartitionKey>,
    /// Reconciliation runs started for the sealed partitions
    pub reconciled: Vec<ReconcileResult>,
}

/// Periodic sealing and reconciliation
pub struct MaintenanceTask {
    ledger: Arc<Ledger>,
    config: MaintenanceConfig,
    cancel: CancellationToken,
    cycle_count: u64,
}

impl MaintenanceTask {
    pub fn new(ledger: Arc<Ledger>, config: MaintenanceConfig, cancel: CancellationToken) -> Self {
        Self {
            ledger,
            config,
            cancel,
            cycle_count: 0,
        }
    }

    /// Spawn the task in the background
    pub fn spawn(
        ledger: Arc<Ledger>,
        config: MaintenanceConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let task = Self::new(ledger, config, cancel);
        tokio::spawn(async move {
            task.run().await;
        })
    }

    async fn run(mut self) {
        info!(
            interval_secs = self.config.interval().as_secs(),
            grace_secs = self.config.seal_grace_secs,
            "Maintenance task started"
        );

        let mut interval = tokio::time::interval(self.config.interval());

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(cycles = self.cycle_count, "Maintenance task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.cycle_count += 1;
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, cycle = self.cycle_count, "Maintenance pass failed");
                    }
                }
            }
        }
    }

    /// Seal elapsed partitions and reconcile them if configured to
    ///
    /// A failed reconciliation is logged and does not fail the pass; the
    /// run is still recorded in the partition's history.
    pub async fn run_once(&self) -> LedgerResult<MaintenanceReport> {
        let manifests = self.ledger.seal_elapsed(self.config.seal_grace()).await?;

        let mut report = MaintenanceReport::default();
        for manifest in manifests {
            let key = manifest.partition;
            report.sealed.push(key);
            if !self.config.reconcile_after_seal {
                continue;
            }
            match self
                .ledger
                .reconcile_with_cancel(&key, self.cancel.child_token())
                .await
            {
                Ok(result) => report.reconciled.push(result),
                Err(e) => warn!(partition = %key, error = %e, "Post-seal reconcile failed"),
            }
        }

        if !report.sealed.is_empty() {
            info!(
                sealed = report.sealed.len(),
                reconciled = report.reconciled.len(),
                "Maintenance pass complete"
            );
        }
        Ok(report)
    }
}
