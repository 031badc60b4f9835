//! In-memory segment store
//!
//! Same semantics as the file backend, including lazy crash-tail truncation,
//! kept entirely in a `DashMap`. Suitable for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use keel_core::PartitionKey;

use super::{FrameOffset, SegmentId, SegmentMeta, SegmentRead, SegmentState, read_bytes};
use crate::SegmentStore;
use crate::error::StorageError;
use crate::frame::{self, FrameScan};

#[derive(Debug)]
struct MemorySegment {
    bytes: Vec<u8>,
    state: SegmentState,
}

/// Segment store backed by memory
#[derive(Debug, Default)]
pub struct InMemorySegmentStore {
    segments: DashMap<SegmentId, MemorySegment>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes without framing (simulates a torn write)
    pub fn inject_raw(&self, id: &SegmentId, bytes: &[u8]) -> Result<(), StorageError> {
        let mut segment = self
            .segments
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found(format!("segment {id}")))?;
        segment.bytes.extend_from_slice(bytes);
        let sealed = segment.state.sealed;
        segment.state = SegmentState::from_bytes(*id, &segment.bytes, sealed);
        Ok(())
    }

    /// Flip bits of a stored byte (simulates media corruption)
    pub fn corrupt_byte(&self, id: &SegmentId, offset: u64, mask: u8) -> Result<(), StorageError> {
        let mut segment = self
            .segments
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found(format!("segment {id}")))?;
        let len = segment.bytes.len();
        let index = usize::try_from(offset)
            .ok()
            .filter(|i| *i < len)
            .ok_or_else(|| StorageError::not_found(format!("offset {offset} in {id}")))?;
        segment.bytes[index] ^= mask;
        Ok(())
    }

    fn snapshot(&self, id: &SegmentId) -> Result<(Vec<u8>, bool), StorageError> {
        self.segments
            .get(id)
            .map(|s| (s.bytes.clone(), s.state.sealed))
            .ok_or_else(|| StorageError::not_found(format!("segment {id}")))
    }
}

#[async_trait]
impl SegmentStore for InMemorySegmentStore {
    async fn create(&self, id: &SegmentId) -> Result<SegmentMeta, StorageError> {
        match self.segments.entry(*id) {
            Entry::Occupied(_) => Err(StorageError::SegmentExists(id.to_string())),
            Entry::Vacant(slot) => {
                let state = SegmentState::empty(*id);
                let meta = state.meta();
                slot.insert(MemorySegment {
                    bytes: Vec::new(),
                    state,
                });
                Ok(meta)
            }
        }
    }

    async fn append(&self, id: &SegmentId, payload: &[u8]) -> Result<FrameOffset, StorageError> {
        let mut segment = self
            .segments
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found(format!("segment {id}")))?;

        if segment.state.sealed {
            return Err(StorageError::SegmentSealed(id.to_string()));
        }

        let tail = segment.state.tail_len();
        if tail > 0 {
            let complete_len = segment.state.complete_len as usize;
            segment.bytes.truncate(complete_len);
            segment.state = SegmentState::from_bytes(*id, &segment.bytes, false);
            warn!(segment = %id, tail_bytes = tail, "Truncated crash tail before append");
        }

        let encoded = frame::encode(payload)?;
        segment.bytes.extend_from_slice(&encoded);
        let at = segment.state.record_append(&encoded);
        debug!(segment = %id, index = at.index, "Appended frame");
        Ok(at)
    }

    async fn seal(&self, id: &SegmentId) -> Result<SegmentMeta, StorageError> {
        let mut segment = self
            .segments
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found(format!("segment {id}")))?;
        segment.state.sealed = true;
        Ok(segment.state.meta())
    }

    async fn read_all(&self, id: &SegmentId) -> Result<SegmentRead, StorageError> {
        let (bytes, sealed) = self.snapshot(id)?;
        Ok(read_bytes(*id, &bytes, sealed))
    }

    async fn scan(&self, id: &SegmentId) -> Result<FrameScan, StorageError> {
        let (bytes, _) = self.snapshot(id)?;
        Ok(frame::scan(&bytes))
    }

    async fn meta(&self, id: &SegmentId) -> Result<SegmentMeta, StorageError> {
        self.segments
            .get(id)
            .map(|s| s.state.meta())
            .ok_or_else(|| StorageError::not_found(format!("segment {id}")))
    }

    async fn list(&self, partition: &PartitionKey) -> Result<Vec<SegmentMeta>, StorageError> {
        let mut metas: Vec<SegmentMeta> = self
            .segments
            .iter()
            .filter(|entry| entry.key().partition == *partition)
            .map(|entry| entry.state.meta())
            .collect();
        metas.sort_by_key(|m| m.id);
        Ok(metas)
    }

    async fn truncate_at(&self, id: &SegmentId, byte_offset: u64) -> Result<SegmentMeta, StorageError> {
        let mut segment = self
            .segments
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found(format!("segment {id}")))?;
        if segment.state.sealed {
            return Err(StorageError::SegmentSealed(id.to_string()));
        }

        let len = usize::try_from(byte_offset).unwrap_or(usize::MAX);
        segment.bytes.truncate(len);
        segment.state = SegmentState::from_bytes(*id, &segment.bytes, false);
        Ok(segment.state.meta())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn segment() -> SegmentId {
        SegmentId::first(PartitionKey::main(
            NaiveDate::from_ymd_opt(2026, 1, 28).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let store = InMemorySegmentStore::new();
        let id = segment();
        store.create(&id).await.unwrap();

        let a = store.append(&id, b"alpha").await.unwrap();
        let b = store.append(&id, b"beta").await.unwrap();
        assert_eq!((a.index, a.offset), (0, 0));
        assert_eq!((b.index, b.offset), (1, 13));

        let read = store.read_all(&id).await.unwrap();
        assert_eq!(read.frames.len(), 2);
        assert_eq!(read.meta.record_count, 2);
        assert_eq!(read.meta, store.meta(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_seal_blocks_appends_and_is_idempotent() {
        let store = InMemorySegmentStore::new();
        let id = segment();
        store.create(&id).await.unwrap();
        store.append(&id, b"one").await.unwrap();

        let first = store.seal(&id).await.unwrap();
        let second = store.seal(&id).await.unwrap();
        assert_eq!(first, second);
        assert!(first.sealed);

        assert!(matches!(
            store.append(&id, b"two").await,
            Err(StorageError::SegmentSealed(_))
        ));
        assert!(matches!(
            store.truncate_at(&id, 0).await,
            Err(StorageError::SegmentSealed(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_byte_is_reported() {
        let store = InMemorySegmentStore::new();
        let id = segment();
        store.create(&id).await.unwrap();
        store.append(&id, b"alpha").await.unwrap();
        store.append(&id, b"beta").await.unwrap();

        store.corrupt_byte(&id, 9, 0x40).unwrap();
        let read = store.read_all(&id).await.unwrap();
        assert_eq!(read.frames.len(), 1);
        assert_eq!(read.report.corrupt.len(), 1);
        assert_eq!(read.meta.record_count, 1);
    }

    #[tokio::test]
    async fn test_truncate_at_drops_frames() {
        let store = InMemorySegmentStore::new();
        let id = segment();
        store.create(&id).await.unwrap();
        store.append(&id, b"alpha").await.unwrap();
        store.append(&id, b"beta").await.unwrap();

        let meta = store.truncate_at(&id, 15).await.unwrap();
        assert_eq!(meta.record_count, 1);
        assert_eq!(meta.byte_size, 15);

        let read = store.read_all(&id).await.unwrap();
        assert_eq!(read.report.crash_tail_bytes(), 2);
    }
}
