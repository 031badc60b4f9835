//! # Keel Ledger
//!
//! Partitioned signal ledger with idempotent ingestion and reconciliation.
//!
//! This crate provides [`Ledger`], which ties together:
//! - Partition lifecycle (open, admit, seal, manifests)
//! - Idempotent ingestion keyed by deterministic ack ids
//! - Reconciliation of admitted ids against a [`Downstream`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_ledger::{Ledger, LedgerConfig};
//!
//! let ledger = Ledger::open(LedgerConfig::with_data_dir("./keel-data")).await?;
//!
//! // Ingest is idempotent: a second call returns `Duplicate`
//! let receipt = ledger.ingest(envelope.clone()).await?;
//! assert!(ledger.ingest(envelope).await?.is_duplicate());
//!
//! // Close the day and reconcile it against the downstream
//! ledger.seal(&receipt.partition).await?;
//! let result = ledger.reconcile(&receipt.partition).await?;
//! println!("{}: {} replayed", result.status, result.replayed_ids.len());
//! ```

mod config;
mod downstream;
mod error;
pub mod gateway;
pub mod maintenance;
pub mod partition;
pub mod reconcile;

pub use config::{
    CatalogConfig, LedgerConfig, MaintenanceConfig, ReconcileConfig, SegmentConfig,
};
pub use downstream::{LocalProcessingStore, ProcessedEntry};
pub use error::{LedgerError, LedgerResult};
pub use gateway::{IngestGateway, IngestReceipt, IngestStatus};
pub use maintenance::{MaintenanceReport, MaintenanceTask};
pub use partition::{
    ManifestVerification, PartitionFilter, PartitionManager, PartitionSnapshot, PartitionSummary,
    SegmentVerification,
};
pub use reconcile::{PartitionDiff, Reconciler};

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use keel_core::{Clock, Downstream, PartitionKey, SignalEnvelope, SystemClock};
use keel_storage::{
    AckStore, FileSegmentStore, InMemorySegmentStore, LedgerRecord, Manifest, PartitionCatalog,
    RedbStorage, ReconcileLog, ReconcileResult, SegmentId, SegmentMeta, SegmentStore,
    StorageError,
};

/// A partition with its manifest and latest reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDetail {
    #[serde(flatten)]
    pub summary: PartitionSummary,
    pub manifest: Option<Manifest>,
    pub latest_reconcile: Option<ReconcileResult>,
}

/// One frame of a segment, as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameView {
    pub segment: SegmentId,
    pub index: u64,
    pub offset: u64,
    /// Payload length from the frame header
    pub length: u32,
    pub stored_crc: u32,
    pub computed_crc: u32,
    pub crc_ok: bool,
    /// Decoded record; absent when the checksum or the payload is bad
    pub record: Option<LedgerRecord>,
    pub decode_error: Option<String>,
}

/// The signal ledger
///
/// Ledger writes happen first and propagation second. Anything the
/// downstream missed is found by [`diff`](Self::diff) and repaired by
/// [`reconcile`](Self::reconcile).
pub struct Ledger {
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
    partitions: Arc<PartitionManager>,
    gateway: IngestGateway,
    reconciler: Reconciler,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("data_dir", &self.config.data_dir)
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open a ledger on disk, reconciling against the embedded
    /// [`LocalProcessingStore`]
    #[instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub async fn open(config: LedgerConfig) -> LedgerResult<Self> {
        let (segments, catalog) = Self::open_stores(&config).await?;
        let downstream = Arc::new(LocalProcessingStore::new(Arc::clone(&catalog)));
        Self::with_stores(config, segments, catalog, downstream, Arc::new(SystemClock)).await
    }

    /// Open a ledger on disk with an external downstream
    #[instrument(skip(config, downstream), fields(data_dir = %config.data_dir.display()))]
    pub async fn open_with_downstream(
        config: LedgerConfig,
        downstream: Arc<dyn Downstream>,
    ) -> LedgerResult<Self> {
        let (segments, catalog) = Self::open_stores(&config).await?;
        Self::with_stores(config, segments, catalog, downstream, Arc::new(SystemClock)).await
    }

    /// Fully in-memory ledger for tests and tooling
    pub async fn in_memory(
        config: LedgerConfig,
        downstream: Arc<dyn Downstream>,
        clock: Arc<dyn Clock>,
    ) -> LedgerResult<Self> {
        let segments = Arc::new(InMemorySegmentStore::new());
        let catalog = Arc::new(RedbStorage::in_memory()?);
        Self::with_stores(config, segments, catalog, downstream, clock).await
    }

    async fn open_stores(
        config: &LedgerConfig,
    ) -> LedgerResult<(Arc<dyn SegmentStore>, Arc<RedbStorage>)> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| StorageError::io(e.to_string()))?;

        let segments = FileSegmentStore::open(config.segment_store()).await?;
        let catalog = RedbStorage::open(config.catalog_store())?;
        Ok((Arc::new(segments), Arc::new(catalog)))
    }

    /// Assemble a ledger from explicit stores and recover partition state
    pub async fn with_stores(
        config: LedgerConfig,
        segments: Arc<dyn SegmentStore>,
        catalog: Arc<RedbStorage>,
        downstream: Arc<dyn Downstream>,
        clock: Arc<dyn Clock>,
    ) -> LedgerResult<Self> {
        let partitions = Arc::new(PartitionManager::new(
            segments,
            PartitionCatalog::new(Arc::clone(&catalog)),
            Arc::clone(&clock),
            &config.segments,
        ));
        let recovered = partitions.recover().await?;

        let gateway = IngestGateway::new(
            Arc::clone(&partitions),
            AckStore::new(Arc::clone(&catalog)),
            config.propagate_on_ingest.then(|| Arc::clone(&downstream)),
            Arc::clone(&clock),
        );
        let reconciler = Reconciler::new(
            Arc::clone(&partitions),
            downstream,
            ReconcileLog::new(catalog),
            Arc::clone(&clock),
            config.reconcile.clone(),
        );

        info!(recovered, propagate = config.propagate_on_ingest, "Ledger ready");
        Ok(Self {
            config,
            clock,
            partitions,
            gateway,
            reconciler,
        })
    }

    /// The configuration this ledger was opened with
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Partition manager for lower-level access
    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }

    /// Ingest an envelope; see [`IngestGateway::ingest`]
    pub async fn ingest(&self, envelope: SignalEnvelope) -> LedgerResult<IngestReceipt> {
        self.gateway.ingest(envelope).await
    }

    /// Open a partition ahead of its first ingest
    pub async fn open_partition(&self, key: PartitionKey) -> LedgerResult<PartitionSummary> {
        self.partitions.open_partition(key).await
    }

    /// Partitions matching a filter, ordered by date then type
    pub async fn list_partitions(&self, filter: PartitionFilter) -> Vec<PartitionSummary> {
        self.partitions.list(filter).await
    }

    /// Summary, manifest and latest reconciliation of a partition
    pub async fn partition_detail(&self, key: &PartitionKey) -> LedgerResult<PartitionDetail> {
        let summary = self.partitions.summary(key).await?;
        Ok(PartitionDetail {
            summary,
            manifest: self.partitions.manifest(key)?,
            latest_reconcile: self.reconciler.latest(key)?,
        })
    }

    /// Seal a MAIN partition
    pub async fn seal(&self, key: &PartitionKey) -> LedgerResult<Manifest> {
        self.partitions.seal(key).await
    }

    /// Seal every open MAIN partition whose day ended more than `grace` ago
    pub async fn seal_elapsed(&self, grace: Duration) -> LedgerResult<Vec<Manifest>> {
        self.partitions
            .seal_elapsed(self.clock.now_utc(), grace)
            .await
    }

    /// Check a sealed partition's segments against its manifest
    pub async fn verify(&self, key: &PartitionKey) -> LedgerResult<ManifestVerification> {
        self.partitions.verify(key).await
    }

    /// Ledger ids missing from the downstream
    pub async fn diff(&self, key: &PartitionKey) -> LedgerResult<PartitionDiff> {
        self.reconciler.diff(key).await
    }

    /// Replay missing ids and confirm
    pub async fn reconcile(&self, key: &PartitionKey) -> LedgerResult<ReconcileResult> {
        self.reconciler.reconcile(key).await
    }

    /// [`reconcile`](Self::reconcile) that stops when `cancel` fires
    pub async fn reconcile_with_cancel(
        &self,
        key: &PartitionKey,
        cancel: CancellationToken,
    ) -> LedgerResult<ReconcileResult> {
        self.reconciler.reconcile_with_cancel(key, cancel).await
    }

    /// Every reconciliation run of a partition, oldest first
    pub fn reconcile_history(&self, key: &PartitionKey) -> LedgerResult<Vec<ReconcileResult>> {
        self.reconciler.history(key)
    }

    /// Latest reconciliation run of a partition
    pub fn latest_reconcile(&self, key: &PartitionKey) -> LedgerResult<Option<ReconcileResult>> {
        self.reconciler.latest(key)
    }

    /// Segments of a partition
    pub async fn segments(&self, key: &PartitionKey) -> LedgerResult<Vec<SegmentMeta>> {
        self.partitions.segments(key).await
    }

    /// Inspect one complete frame of a segment
    ///
    /// Frames with a bad checksum are returned with `crc_ok == false` and
    /// no record. Crash-tail residue is not a frame.
    #[instrument(skip(self), fields(segment = %segment))]
    pub async fn frame(&self, segment: &SegmentId, index: u64) -> LedgerResult<FrameView> {
        let known = self.partitions.segments(&segment.partition).await?;
        if !known.iter().any(|meta| &meta.id == segment) {
            return Err(LedgerError::SegmentNotFound(*segment));
        }

        let scan = self.partitions.segment_store().scan(segment).await?;
        let frame = scan.get(index).ok_or_else(|| LedgerError::FrameNotFound {
            segment: *segment,
            index,
        })?;

        let crc_ok = frame.crc_ok();
        let (record, decode_error) = if !crc_ok {
            (None, Some("checksum mismatch".to_string()))
        } else {
            match LedgerRecord::decode(&frame.payload) {
                Ok(record) => (Some(record), None),
                Err(e) => (None, Some(e.to_string())),
            }
        };

        Ok(FrameView {
            segment: *segment,
            index: frame.index,
            offset: frame.offset,
            length: frame.payload.len() as u32,
            stored_crc: frame.stored_crc,
            computed_crc: frame.computed_crc,
            crc_ok,
            record,
            decode_error,
        })
    }
}
