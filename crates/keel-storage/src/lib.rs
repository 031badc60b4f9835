//! # Keel Storage
//!
//! Storage engine for the Keel signal ledger.
//!
//! ## Features
//!
//! - **Frame codec**: length + CRC32 framing with fail-closed decoding
//! - **SegmentStore trait**: append-only segments with one-way sealing
//! - **FileSegmentStore**: one file per segment, fsynced appends
//! - **InMemorySegmentStore**: in-memory segments for tests
//! - **Catalog**: redb tables for partitions, manifests, ack records and
//!   reconciliation history
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_storage::{InMemorySegmentStore, SegmentId, SegmentStore};
//!
//! let store = InMemorySegmentStore::new();
//! let id = SegmentId::first(partition);
//! store.create(&id).await?;
//! store.append(&id, b"payload").await?;
//! let read = store.read_all(&id).await?;
//! assert!(read.report.is_clean());
//! ```

pub mod error;
pub mod frame;
pub mod record;
pub mod segment;
pub mod structured;

// Re-exports
pub use error::StorageError;
pub use frame::{CorruptFrame, CrashTail, DecodeReport, DecodedStream, Frame, FrameScan, ScannedFrame};
pub use record::LedgerRecord;
pub use segment::{
    FileSegmentStore, FileSegmentStoreConfig, FrameOffset, InMemorySegmentStore, SegmentId,
    SegmentMeta, SegmentRead,
};
pub use structured::{
    AckRecord, AckState, AckStore, Manifest, PartitionCatalog, PartitionRecord, RedbStorage,
    RedbStorageConfig, ReconcileLog, ReconcileResult, ReconcileStatus, ReplayFailure,
    Reservation, SegmentChecksum,
};

use async_trait::async_trait;
use keel_core::PartitionKey;

/// Append-only segment storage
///
/// Segments accept appends until sealed. Sealing is one-way and never
/// rewrites stored bytes. Reads decode through the frame codec: corrupt
/// frames and crash-tail residue are excluded from the returned frames and
/// described in the accompanying [`DecodeReport`].
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Create an empty open segment
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SegmentExists`] if the segment already exists.
    async fn create(&self, id: &SegmentId) -> Result<SegmentMeta, StorageError>;

    /// Append one frame carrying `payload`
    ///
    /// The frame is durable when this returns. A crash tail left by an
    /// earlier interrupted append is removed first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SegmentSealed`] if the segment is sealed.
    async fn append(&self, id: &SegmentId, payload: &[u8]) -> Result<FrameOffset, StorageError>;

    /// Seal a segment; sealing an already-sealed segment returns its metadata
    async fn seal(&self, id: &SegmentId) -> Result<SegmentMeta, StorageError>;

    /// Read and decode every frame in a segment
    async fn read_all(&self, id: &SegmentId) -> Result<SegmentRead, StorageError>;

    /// Scan a segment without filtering corrupt frames
    async fn scan(&self, id: &SegmentId) -> Result<FrameScan, StorageError>;

    /// Current metadata of a segment
    async fn meta(&self, id: &SegmentId) -> Result<SegmentMeta, StorageError>;

    /// Segments of a partition, ordered by ordinal
    async fn list(&self, partition: &PartitionKey) -> Result<Vec<SegmentMeta>, StorageError>;

    /// Cut an open segment at a byte offset
    ///
    /// Used to simulate torn writes. Offsets past the end are clamped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SegmentSealed`] if the segment is sealed.
    async fn truncate_at(&self, id: &SegmentId, byte_offset: u64) -> Result<SegmentMeta, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    /// Test that the SegmentStore trait is object-safe
    fn _assert_object_safe(_: &dyn SegmentStore) {}

    fn partition() -> PartitionKey {
        PartitionKey::main(NaiveDate::from_ymd_opt(2026, 1, 28).unwrap())
    }

    /// Exercises both backends through the trait object
    async fn exercise(store: &dyn SegmentStore) {
        let id = SegmentId::first(partition());
        store.create(&id).await.unwrap();

        for i in 1..=3u64 {
            let at = store.append(&id, &i.to_be_bytes()).await.unwrap();
            assert_eq!(at.index, i - 1);
        }

        let meta = store.seal(&id).await.unwrap();
        assert_eq!(meta.record_count, 3);
        assert!(meta.sealed);

        let read = store.read_all(&id).await.unwrap();
        assert_eq!(read.meta, meta);
        assert_eq!(read.frames.len(), 3);

        assert_eq!(store.list(&partition()).await.unwrap(), vec![meta]);
    }

    #[tokio::test]
    async fn test_in_memory_segment_store() {
        exercise(&InMemorySegmentStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_segment_store() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = FileSegmentStore::open(FileSegmentStoreConfig::with_base_dir(temp.path()))
            .await
            .unwrap();
        exercise(&store).await;
    }
}
