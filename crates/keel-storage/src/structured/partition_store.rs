//! Partition records and seal manifests

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_core::{PartitionKey, PartitionStatus};

use super::tables::{BatchWrite, MANIFESTS, PARTITIONS, RedbStorage};
use crate::error::StorageError;
use crate::segment::{SegmentId, SegmentMeta};

/// Catalog entry for a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub key: PartitionKey,
    pub status: PartitionStatus,
    /// Highest sequence as of the last catalog write
    pub highwater_sequence: u64,
    pub opened_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    /// Revision of the current manifest (0 until first sealed)
    pub manifest_revision: u32,
}

impl PartitionRecord {
    /// A freshly opened partition
    pub fn open(key: PartitionKey, opened_at: DateTime<Utc>) -> Self {
        Self {
            key,
            status: PartitionStatus::Open,
            highwater_sequence: 0,
            opened_at,
            sealed_at: None,
            manifest_revision: 0,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.status == PartitionStatus::Sealed
    }
}

/// Checksum entry for one segment in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentChecksum {
    pub segment: SegmentId,
    pub record_count: u64,
    pub byte_size: u64,
    pub checksum: u32,
}

impl From<&SegmentMeta> for SegmentChecksum {
    fn from(meta: &SegmentMeta) -> Self {
        Self {
            segment: meta.id,
            record_count: meta.record_count,
            byte_size: meta.byte_size,
            checksum: meta.checksum,
        }
    }
}

/// Record of a partition's contents at seal time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub partition: PartitionKey,
    pub sealed_at: DateTime<Utc>,
    pub total_records: u64,
    pub highwater_sequence: u64,
    /// 1 on first seal, incremented by every re-seal
    pub revision: u32,
    pub segments: Vec<SegmentChecksum>,
}

impl Manifest {
    /// Whether `total_records` equals the sum over segments
    pub fn is_consistent(&self) -> bool {
        self.total_records == self.segments.iter().map(|s| s.record_count).sum::<u64>()
    }
}

/// Partition and manifest storage
#[derive(Debug)]
pub struct PartitionCatalog {
    storage: Arc<RedbStorage>,
}

impl PartitionCatalog {
    pub fn new(storage: Arc<RedbStorage>) -> Self {
        Self { storage }
    }

    /// Store a partition record
    pub fn put(&self, record: &PartitionRecord) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(record)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        self.storage.put(PARTITIONS, &record.key.to_bytes(), &value)
    }

    /// Load a partition record
    pub fn get(&self, key: &PartitionKey) -> Result<Option<PartitionRecord>, StorageError> {
        match self.storage.get(PARTITIONS, &key.to_bytes())? {
            Some(value) => Ok(Some(postcard::from_bytes(&value)?)),
            None => Ok(None),
        }
    }

    /// All partition records, ordered by key
    pub fn list(&self) -> Result<Vec<PartitionRecord>, StorageError> {
        let mut records = self
            .storage
            .scan_prefix(PARTITIONS, b"")?
            .into_iter()
            .map(|(_, value)| postcard::from_bytes::<PartitionRecord>(&value))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| r.key);
        Ok(records)
    }

    /// Store a sealed partition record and its manifest atomically
    pub fn put_sealed(
        &self,
        record: &PartitionRecord,
        manifest: &Manifest,
    ) -> Result<(), StorageError> {
        let key = record.key.to_bytes();
        let record_bytes = postcard::to_allocvec(record)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        let manifest_bytes = postcard::to_allocvec(manifest)
            .map_err(|e| StorageError::serialization(e.to_string()))?;

        self.storage.put_many(&[
            BatchWrite::new(PARTITIONS, key.clone(), record_bytes),
            BatchWrite::new(MANIFESTS, key, manifest_bytes),
        ])?;
        debug!(partition = %record.key, revision = manifest.revision, "Stored manifest");
        Ok(())
    }

    /// Load the current manifest of a partition
    pub fn manifest(&self, key: &PartitionKey) -> Result<Option<Manifest>, StorageError> {
        match self.storage.get(MANIFESTS, &key.to_bytes())? {
            Some(value) => Ok(Some(postcard::from_bytes(&value)?)),
            None => Ok(None),
        }
    }
}
