//! Reconciliation run history
//!
//! Every run is kept. Keys sort by partition, then start time, so the last
//! entry under a partition prefix is the authoritative (latest) run.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keel_core::{PartitionKey, SignalId};

use super::tables::{RECONCILE_RUNS, RedbStorage};
use crate::error::StorageError;

/// Outcome of a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileStatus {
    /// Re-diff confirmed nothing is missing
    Completed,
    /// Some work remains or the run could not confirm its result
    Partial,
    /// The downstream could not be used at all
    Failed,
    /// The partition is not reconciled under the current policy
    Skipped,
}

impl fmt::Display for ReconcileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// A replay that did not succeed within its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFailure {
    pub signal_id: SignalId,
    pub attempts: u32,
    pub error: String,
    /// Whether the last attempt failed because the downstream was unreachable
    pub unreachable: bool,
}

/// Result of one reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub run_id: Uuid,
    pub partition: PartitionKey,
    pub status: ReconcileStatus,
    /// Records decoded from the ledger
    pub ledger_record_count: u64,
    /// Ids the downstream reported before replay
    pub processed_count: u64,
    /// Missing ids found by the initial diff
    pub missing_before: u64,
    /// Missing ids left after the confirming re-diff
    pub missing_count: u64,
    pub replayed_ids: Vec<SignalId>,
    pub failures: Vec<ReplayFailure>,
    /// Frames excluded for checksum mismatch
    pub corrupt_frames: u64,
    /// Crash-tail residue bytes
    pub crash_tail_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Why the run ended the way it did, when not self-evident
    pub note: Option<String>,
}

impl ReconcileResult {
    /// A run that has not yet done anything
    pub fn begin(partition: PartitionKey, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            partition,
            status: ReconcileStatus::Partial,
            ledger_record_count: 0,
            processed_count: 0,
            missing_before: 0,
            missing_count: 0,
            replayed_ids: Vec::new(),
            failures: Vec::new(),
            corrupt_frames: 0,
            crash_tail_bytes: 0,
            started_at,
            duration_ms: 0,
            note: None,
        }
    }
}

/// Reconciliation history storage
#[derive(Debug)]
pub struct ReconcileLog {
    storage: Arc<RedbStorage>,
}

impl ReconcileLog {
    pub fn new(storage: Arc<RedbStorage>) -> Self {
        Self { storage }
    }

    fn prefix(partition: &PartitionKey) -> Vec<u8> {
        let mut prefix = partition.to_bytes();
        prefix.push(b'/');
        prefix
    }

    fn run_key(result: &ReconcileResult) -> Vec<u8> {
        let mut key = Self::prefix(&result.partition);
        // Offset so that pre-epoch instants still sort correctly as unsigned bytes
        let micros = (result.started_at.timestamp_micros() as u64) ^ (1 << 63);
        key.extend_from_slice(&micros.to_be_bytes());
        key.extend_from_slice(result.run_id.as_bytes());
        key
    }

    /// Append a run to the history
    pub fn append(&self, result: &ReconcileResult) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(result)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        self.storage.put(RECONCILE_RUNS, &Self::run_key(result), &value)
    }

    /// Every run for a partition, oldest first
    pub fn history(&self, partition: &PartitionKey) -> Result<Vec<ReconcileResult>, StorageError> {
        self.storage
            .scan_prefix(RECONCILE_RUNS, &Self::prefix(partition))?
            .into_iter()
            .map(|(_, value)| postcard::from_bytes(&value).map_err(StorageError::from))
            .collect()
    }

    /// The most recent run for a partition
    pub fn latest(&self, partition: &PartitionKey) -> Result<Option<ReconcileResult>, StorageError> {
        Ok(self.history(partition)?.pop())
    }
}
