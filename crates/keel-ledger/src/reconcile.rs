//! Diff-and-replay reconciliation
//!
//! The ledger is authoritative. A run snapshots the partition's admitted
//! ids, asks the downstream which ids it has processed, replays the
//! difference, and then asks again. Only that second answer can make a run
//! `Completed`; attempted replays alone never do.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use keel_core::{
    AckId, Clock, Delivery, Downstream, DownstreamError, PartitionKey, PartitionStatus,
    SignalId,
};
use keel_storage::{LedgerRecord, ReconcileLog, ReconcileResult, ReconcileStatus, ReplayFailure};

use crate::config::ReconcileConfig;
use crate::error::LedgerResult;
use crate::partition::PartitionManager;

/// Ledger ids, downstream ids and their difference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDiff {
    pub partition: PartitionKey,
    pub ledger_ids: BTreeSet<SignalId>,
    pub processed_ids: BTreeSet<SignalId>,
    pub missing_ids: BTreeSet<SignalId>,
}

impl PartitionDiff {
    pub fn missing_count(&self) -> usize {
        self.missing_ids.len()
    }
}

/// Ids in `ledger` but not in `processed`, by one merge pass over both
pub fn missing_ids(ledger: &BTreeSet<SignalId>, processed: &BTreeSet<SignalId>) -> BTreeSet<SignalId> {
    let mut missing = BTreeSet::new();
    let mut theirs = processed.iter().peekable();
    for id in ledger {
        while theirs.next_if(|p| *p < id).is_some() {}
        if theirs.peek() != Some(&id) {
            missing.insert(id.clone());
        }
    }
    missing
}

enum ReplayOutcome {
    Delivered,
    Failed(ReplayFailure),
    Cancelled,
}

/// Reconciles partitions against the downstream
pub struct Reconciler {
    partitions: Arc<PartitionManager>,
    downstream: Arc<dyn Downstream>,
    log: ReconcileLog,
    clock: Arc<dyn Clock>,
    config: ReconcileConfig,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        partitions: Arc<PartitionManager>,
        downstream: Arc<dyn Downstream>,
        log: ReconcileLog,
        clock: Arc<dyn Clock>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            partitions,
            downstream,
            log,
            clock,
            config,
        }
    }

    /// Downstream call bounded by the replay timeout
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, DownstreamError>>,
    ) -> Result<T, DownstreamError> {
        let timeout = self.config.replay_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DownstreamError::Timeout {
                millis: timeout.as_millis() as u64,
            }),
        }
    }

    /// Compute the set difference between ledger and downstream
    #[instrument(skip(self), fields(partition = %key))]
    pub async fn diff(&self, key: &PartitionKey) -> LedgerResult<PartitionDiff> {
        let snapshot = self.partitions.snapshot(key).await?;
        let ledger_ids: BTreeSet<SignalId> = snapshot.signal_ids().cloned().collect();
        let processed_ids = self.bounded(self.downstream.processed_ids(key)).await?;
        let missing = missing_ids(&ledger_ids, &processed_ids);

        debug!(
            ledger = ledger_ids.len(),
            processed = processed_ids.len(),
            missing = missing.len(),
            "Computed diff"
        );
        Ok(PartitionDiff {
            partition: *key,
            ledger_ids,
            processed_ids,
            missing_ids: missing,
        })
    }

    /// Reconcile a partition
    pub async fn reconcile(&self, key: &PartitionKey) -> LedgerResult<ReconcileResult> {
        self.reconcile_with_cancel(key, CancellationToken::new())
            .await
    }

    /// Reconcile a partition, stopping early when `cancel` fires
    ///
    /// Replays already delivered stay delivered; a cancelled run reports
    /// `Partial`. Every run is appended to the partition's history.
    #[instrument(skip(self, cancel), fields(partition = %key))]
    pub async fn reconcile_with_cancel(
        &self,
        key: &PartitionKey,
        cancel: CancellationToken,
    ) -> LedgerResult<ReconcileResult> {
        let started = Instant::now();
        let mut result = ReconcileResult::begin(*key, self.clock.now_utc());
        let status = self.partitions.status(key).await?;
        let Some(status) = status else {
            return Err(crate::LedgerError::PartitionNotFound(*key));
        };

        self.run(key, status, &cancel, &mut result).await?;

        result.duration_ms = started.elapsed().as_millis() as u64;
        self.log.append(&result)?;

        info!(
            status = %result.status,
            missing_before = result.missing_before,
            replayed = result.replayed_ids.len(),
            failed = result.failures.len(),
            missing_after = result.missing_count,
            duration_ms = result.duration_ms,
            "Reconcile finished"
        );
        Ok(result)
    }

    async fn run(
        &self,
        key: &PartitionKey,
        status: PartitionStatus,
        cancel: &CancellationToken,
        result: &mut ReconcileResult,
    ) -> LedgerResult<()> {
        if !key.is_main() && !self.config.reconcile_late {
            result.status = ReconcileStatus::Skipped;
            result.note = Some("LATE partitions are not reconciled".into());
            return Ok(());
        }

        let snapshot = self.partitions.snapshot(key).await?;
        result.ledger_record_count = snapshot.records.len() as u64;
        result.corrupt_frames = snapshot.report.corrupt.len() as u64;
        result.crash_tail_bytes = snapshot.report.crash_tail_bytes();
        if !snapshot.report.is_clean() {
            warn!(
                corrupt = result.corrupt_frames,
                tail_bytes = result.crash_tail_bytes,
                "Reconciling over damaged segments"
            );
        }

        let by_id: HashMap<SignalId, LedgerRecord> = snapshot
            .records
            .into_iter()
            .map(|r| (r.envelope.signal_id.clone(), r))
            .collect();
        let ledger_ids: BTreeSet<SignalId> = by_id.keys().cloned().collect();

        let processed = match self.bounded(self.downstream.processed_ids(key)).await {
            Ok(processed) => processed,
            Err(e) => {
                warn!(error = %e, "Downstream unavailable for diff");
                result.status = ReconcileStatus::Failed;
                result.note = Some(format!("initial diff failed: {e}"));
                return Ok(());
            }
        };
        result.processed_count = processed.len() as u64;

        let missing = missing_ids(&ledger_ids, &processed);
        result.missing_before = missing.len() as u64;
        result.missing_count = result.missing_before;

        let mut cancelled = false;
        for id in &missing {
            let Some(record) = by_id.get(id) else {
                continue;
            };
            match self.replay(key, record, cancel).await {
                ReplayOutcome::Delivered => result.replayed_ids.push(id.clone()),
                ReplayOutcome::Failed(failure) => {
                    warn!(
                        signal_id = %id,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Replay failed"
                    );
                    result.failures.push(failure);
                }
                ReplayOutcome::Cancelled => {
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            result.status = ReconcileStatus::Partial;
            result.note = Some("cancelled before confirmation".into());
            return Ok(());
        }

        if !missing.is_empty()
            && result.replayed_ids.is_empty()
            && result.failures.iter().all(|f| f.unreachable)
        {
            result.status = ReconcileStatus::Failed;
            result.note = Some("downstream unreachable for every replay".into());
            return Ok(());
        }

        // Confirm against the downstream rather than trusting the replays
        match self.bounded(self.downstream.processed_ids(key)).await {
            Ok(after) => {
                result.missing_count = missing_ids(&ledger_ids, &after).len() as u64;
            }
            Err(e) => {
                result.status = ReconcileStatus::Partial;
                result.note = Some(format!("confirmation diff failed: {e}"));
                return Ok(());
            }
        }

        result.status = if result.missing_count > 0 {
            ReconcileStatus::Partial
        } else if self.config.require_sealed_main
            && key.is_main()
            && status == PartitionStatus::Open
        {
            result.note = Some("partition still open".into());
            ReconcileStatus::Partial
        } else {
            ReconcileStatus::Completed
        };
        Ok(())
    }

    /// Deliver one record with timeout and bounded retries
    async fn replay(
        &self,
        key: &PartitionKey,
        record: &LedgerRecord,
        cancel: &CancellationToken,
    ) -> ReplayOutcome {
        let delivery = Delivery {
            partition: *key,
            sequence: record.sequence,
            ack_id: AckId::derive(&record.envelope.signal_id),
            envelope: record.envelope.clone(),
        };

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ReplayOutcome::Cancelled,
                outcome = self.bounded(self.downstream.deliver(&delivery)) => outcome,
            };
            match outcome {
                Ok(()) => {
                    debug!(signal_id = %delivery.signal_id(), attempt, "Replayed");
                    return ReplayOutcome::Delivered;
                }
                Err(e) => last_error = Some(e),
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ReplayOutcome::Cancelled,
                    _ = tokio::time::sleep(self.config.backoff(attempt)) => {}
                }
            }
        }

        let unreachable = last_error.as_ref().is_some_and(DownstreamError::is_unreachable);
        ReplayOutcome::Failed(ReplayFailure {
            signal_id: delivery.signal_id().clone(),
            attempts,
            error: last_error.map(|e| e.to_string()).unwrap_or_default(),
            unreachable,
        })
    }

    /// Every run for a partition, oldest first
    pub fn history(&self, key: &PartitionKey) -> LedgerResult<Vec<ReconcileResult>> {
        Ok(self.log.history(key)?)
    }

    /// The authoritative (latest) run for a partition
    pub fn latest(&self, key: &PartitionKey) -> LedgerResult<Option<ReconcileResult>> {
        Ok(self.log.latest(key)?)
    }
}
