//! Local processing store
//!
//! A [`Downstream`] backed by the catalog database. It records each
//! delivered signal under `partition/signal_id` so it can answer
//! `processed_ids` without a remote call. Useful as the default consumer of
//! a standalone ledger and as a durable stand-in during tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_core::{AckId, Delivery, Downstream, DownstreamError, PartitionKey, SignalId};
use keel_storage::structured::PROCESSED;
use keel_storage::{RedbStorage, StorageError};

/// What the store remembers about a processed signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub signal_id: SignalId,
    pub ack_id: AckId,
    pub sequence: u64,
    pub processed_at: DateTime<Utc>,
}

/// Downstream that persists processed ids in redb
#[derive(Debug, Clone)]
pub struct LocalProcessingStore {
    storage: Arc<RedbStorage>,
}

impl LocalProcessingStore {
    pub fn new(storage: Arc<RedbStorage>) -> Self {
        Self { storage }
    }

    fn prefix(partition: &PartitionKey) -> Vec<u8> {
        let mut prefix = partition.to_bytes();
        prefix.push(b'/');
        prefix
    }

    fn key(partition: &PartitionKey, signal_id: &SignalId) -> Vec<u8> {
        let mut key = Self::prefix(partition);
        key.extend_from_slice(signal_id.as_str().as_bytes());
        key
    }

    /// Stored entry for a signal, if it was processed
    pub fn entry(
        &self,
        partition: &PartitionKey,
        signal_id: &SignalId,
    ) -> Result<Option<ProcessedEntry>, StorageError> {
        self.storage
            .get(PROCESSED, &Self::key(partition, signal_id))?
            .map(|bytes| postcard::from_bytes(&bytes).map_err(StorageError::from))
            .transpose()
    }

    /// Number of processed signals in a partition
    pub fn count(&self, partition: &PartitionKey) -> Result<usize, StorageError> {
        self.storage
            .count_prefix(PROCESSED, &Self::prefix(partition))
    }

    fn unavailable(err: StorageError) -> DownstreamError {
        DownstreamError::Unreachable(err.to_string())
    }
}

#[async_trait]
impl Downstream for LocalProcessingStore {
    async fn processed_ids(
        &self,
        partition: &PartitionKey,
    ) -> Result<BTreeSet<SignalId>, DownstreamError> {
        let prefix = Self::prefix(partition);
        let rows = self
            .storage
            .scan_prefix(PROCESSED, &prefix)
            .map_err(Self::unavailable)?;

        let mut ids = BTreeSet::new();
        for (key, _) in rows {
            let id = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| DownstreamError::Unreachable(e.to_string()))?;
            ids.insert(SignalId::new(id));
        }
        Ok(ids)
    }

    async fn deliver(&self, delivery: &Delivery) -> Result<(), DownstreamError> {
        let entry = ProcessedEntry {
            signal_id: delivery.signal_id().clone(),
            ack_id: delivery.ack_id.clone(),
            sequence: delivery.sequence,
            processed_at: Utc::now(),
        };
        let value = postcard::to_allocvec(&entry)
            .map_err(|e| DownstreamError::Rejected {
                signal_id: entry.signal_id.to_string(),
                reason: e.to_string(),
            })?;

        // Redelivery keeps the first entry
        let existing = self
            .storage
            .insert_if_absent(
                PROCESSED,
                &Self::key(&delivery.partition, &entry.signal_id),
                &value,
            )
            .map_err(Self::unavailable)?;
        if existing.is_some() {
            debug!(signal_id = %entry.signal_id, "Already processed");
        }
        Ok(())
    }
}
