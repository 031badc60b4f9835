//! File-backed segment store
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/2026-01-28.main/000001.seg     frames
//! <base>/2026-01-28.main/000001.sealed  postcard SegmentMeta, written on seal
//! ```
//!
//! Segment state is rebuilt lazily by scanning the data file the first time
//! a segment is touched after startup. A crash tail left by an interrupted
//! append is reported by reads and cut off only right before the next append
//! to that (still open) segment.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use keel_core::PartitionKey;

use super::{FrameOffset, SegmentId, SegmentMeta, SegmentRead, SegmentState, read_bytes};
use crate::SegmentStore;
use crate::error::StorageError;
use crate::frame::{self, FrameScan};

const SEGMENT_EXT: &str = "seg";
const SEALED_EXT: &str = "sealed";

/// Configuration for the file segment store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSegmentStoreConfig {
    /// Directory holding one subdirectory per partition
    pub base_dir: PathBuf,
    /// `sync_data` after every append
    pub sync_on_write: bool,
}

impl Default for FileSegmentStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/segments"),
            sync_on_write: true,
        }
    }
}

impl FileSegmentStoreConfig {
    /// Create a config rooted at a base directory
    pub fn with_base_dir(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

/// Persisted seal marker
#[derive(Debug, Serialize, Deserialize)]
struct SealMarker {
    meta: SegmentMeta,
    sealed_at_millis: i64,
}

#[derive(Debug)]
struct SegmentHandle {
    path: PathBuf,
    state: SegmentState,
    /// Opened on first append
    writer: Option<File>,
}

/// Segment store writing one file per segment
#[derive(Debug)]
pub struct FileSegmentStore {
    config: FileSegmentStoreConfig,
    handles: DashMap<SegmentId, Arc<Mutex<SegmentHandle>>>,
}

impl FileSegmentStore {
    /// Open a store, creating the base directory if needed
    #[instrument(skip(config), fields(base_dir = %config.base_dir.display()))]
    pub async fn open(config: FileSegmentStoreConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.base_dir).await?;
        info!("Opened file segment store");
        Ok(Self {
            config,
            handles: DashMap::new(),
        })
    }

    /// Base directory of the store
    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    fn partition_dir(&self, partition: &PartitionKey) -> PathBuf {
        self.config.base_dir.join(partition.to_string())
    }

    /// Path of a segment's data file
    pub fn segment_path(&self, id: &SegmentId) -> PathBuf {
        self.partition_dir(&id.partition).join(id.file_name())
    }

    fn marker_path(&self, id: &SegmentId) -> PathBuf {
        self.partition_dir(&id.partition)
            .join(format!("{}.{}", id.stem(), SEALED_EXT))
    }

    /// Get the cached handle for a segment, loading it from disk if needed
    async fn handle(&self, id: &SegmentId) -> Result<Arc<Mutex<SegmentHandle>>, StorageError> {
        if let Some(handle) = self.handles.get(id) {
            return Ok(Arc::clone(handle.value()));
        }

        let path = self.segment_path(id);
        if !fs::try_exists(&path).await? {
            return Err(StorageError::not_found(format!("segment {id}")));
        }

        let bytes = fs::read(&path).await?;
        let sealed = fs::try_exists(self.marker_path(id)).await?;
        let state = SegmentState::from_bytes(*id, &bytes, sealed);
        if sealed {
            self.check_marker(&state).await?;
        }
        if state.tail_len() > 0 {
            warn!(
                segment = %id,
                tail_bytes = state.tail_len(),
                "Segment has crash-tail residue"
            );
        }
        debug!(segment = %id, records = state.record_count, sealed, "Loaded segment");

        let loaded = Arc::new(Mutex::new(SegmentHandle {
            path,
            state,
            writer: None,
        }));
        let handle = self
            .handles
            .entry(*id)
            .or_insert(loaded)
            .value()
            .clone();
        Ok(handle)
    }

    /// Compare a sealed segment's bytes with the checksums recorded at seal
    async fn check_marker(&self, state: &SegmentState) -> Result<(), StorageError> {
        let bytes = fs::read(self.marker_path(&state.id)).await?;
        let marker: SealMarker = postcard::from_bytes(&bytes)?;
        if marker.meta.checksum != state.checksum || marker.meta.byte_size != state.total_len {
            warn!(
                segment = %state.id,
                sealed_checksum = marker.meta.checksum,
                current_checksum = state.checksum,
                sealed_at_millis = marker.sealed_at_millis,
                "Sealed segment no longer matches its seal marker"
            );
        }
        Ok(())
    }

    /// Bring an open segment back to its last acknowledged frame before
    /// writing after it.
    ///
    /// Bytes past the acknowledged length were never reported as appended,
    /// whether a failed write left them or something else wrote them, and
    /// are cut off. A file shorter than expected is rescanned.
    async fn prepare_append(&self, handle: &mut SegmentHandle) -> Result<(), StorageError> {
        let on_disk = fs::metadata(&handle.path).await?.len();
        let acknowledged = handle.state.total_len;
        if on_disk > acknowledged {
            handle.writer = None;
            set_file_len(&handle.path, acknowledged).await?;
            warn!(
                segment = %handle.state.id,
                orphaned_bytes = on_disk - acknowledged,
                truncated_to = acknowledged,
                "Dropped unacknowledged bytes before append"
            );
        } else if on_disk < acknowledged {
            handle.writer = None;
            let bytes = fs::read(&handle.path).await?;
            handle.state = SegmentState::from_bytes(handle.state.id, &bytes, false);
            warn!(
                segment = %handle.state.id,
                expected = acknowledged,
                on_disk,
                "Segment shrank on disk, rescanned"
            );
        }
        self.repair_tail(handle).await
    }

    /// Cut a crash tail off an open segment before writing after it
    async fn repair_tail(&self, handle: &mut SegmentHandle) -> Result<(), StorageError> {
        let tail = handle.state.tail_len();
        if tail == 0 {
            return Ok(());
        }

        let complete_len = handle.state.complete_len;
        handle.writer = None;
        set_file_len(&handle.path, complete_len).await?;

        let bytes = fs::read(&handle.path).await?;
        handle.state = SegmentState::from_bytes(handle.state.id, &bytes, false);
        warn!(
            segment = %handle.state.id,
            tail_bytes = tail,
            truncated_to = complete_len,
            "Truncated crash tail before append"
        );
        Ok(())
    }

    async fn write_frame(
        handle: &mut SegmentHandle,
        encoded: &[u8],
        sync: bool,
    ) -> Result<(), StorageError> {
        let writer = Self::writer(handle).await?;
        writer.write_all(encoded).await?;
        writer.flush().await?;
        if sync {
            writer.sync_data().await?;
        }
        Ok(())
    }

    async fn writer<'a>(handle: &'a mut SegmentHandle) -> Result<&'a mut File, StorageError> {
        if handle.writer.is_none() {
            let file = OpenOptions::new().append(true).open(&handle.path).await?;
            handle.writer = Some(file);
        }
        handle
            .writer
            .as_mut()
            .ok_or_else(|| StorageError::io("segment writer unavailable"))
    }

    async fn load_bytes(&self, id: &SegmentId) -> Result<(Vec<u8>, bool), StorageError> {
        let handle = self.handle(id).await?;
        let guard = handle.lock().await;
        let bytes = fs::read(&guard.path).await?;
        Ok((bytes, guard.state.sealed))
    }
}

/// Resize a data file and make the new length durable
async fn set_file_len(path: &Path, len: u64) -> Result<(), StorageError> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_all().await?;
    Ok(())
}

/// Make entries created or renamed inside a directory durable
async fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[async_trait]
impl SegmentStore for FileSegmentStore {
    #[instrument(skip(self), fields(segment = %id))]
    async fn create(&self, id: &SegmentId) -> Result<SegmentMeta, StorageError> {
        let path = self.segment_path(id);
        if self.handles.contains_key(id) || fs::try_exists(&path).await? {
            return Err(StorageError::SegmentExists(id.to_string()));
        }

        fs::create_dir_all(self.partition_dir(&id.partition)).await?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.sync_all().await?;
        sync_dir(&self.config.base_dir).await?;
        sync_dir(&self.partition_dir(&id.partition)).await?;

        let state = SegmentState::empty(*id);
        let meta = state.meta();
        self.handles.insert(
            *id,
            Arc::new(Mutex::new(SegmentHandle {
                path,
                state,
                writer: None,
            })),
        );

        info!("Created segment");
        Ok(meta)
    }

    async fn append(&self, id: &SegmentId, payload: &[u8]) -> Result<FrameOffset, StorageError> {
        let handle = self.handle(id).await?;
        let mut guard = handle.lock().await;

        if guard.state.sealed {
            return Err(StorageError::SegmentSealed(id.to_string()));
        }
        self.prepare_append(&mut guard).await?;

        let encoded = frame::encode(payload)?;
        if let Err(e) = Self::write_frame(&mut guard, &encoded, self.config.sync_on_write).await {
            // The frame is not acknowledged, so none of it may stay on disk.
            // If this rollback fails too, the next append cuts it instead.
            guard.writer = None;
            if let Err(rollback) = set_file_len(&guard.path, guard.state.total_len).await {
                warn!(segment = %id, error = %rollback, "Could not roll back failed append");
            }
            return Err(e);
        }

        let at = guard.state.record_append(&encoded);
        debug!(
            segment = %id,
            index = at.index,
            offset = at.offset,
            bytes = encoded.len(),
            "Appended frame"
        );
        Ok(at)
    }

    #[instrument(skip(self), fields(segment = %id))]
    async fn seal(&self, id: &SegmentId) -> Result<SegmentMeta, StorageError> {
        let handle = self.handle(id).await?;
        let mut guard = handle.lock().await;

        if guard.state.sealed {
            return Ok(guard.state.meta());
        }

        if let Some(writer) = guard.writer.take() {
            writer.sync_all().await?;
        }

        let mut state = guard.state.clone();
        state.sealed = true;
        let marker = SealMarker {
            meta: state.meta(),
            sealed_at_millis: chrono::Utc::now().timestamp_millis(),
        };
        let encoded = postcard::to_allocvec(&marker)
            .map_err(|e| StorageError::serialization(e.to_string()))?;

        let marker_path = self.marker_path(id);
        let tmp_path = marker_path.with_extension(format!("{SEALED_EXT}.tmp"));
        let mut file = File::create(&tmp_path).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, &marker_path).await?;
        sync_dir(&self.partition_dir(&id.partition)).await?;

        guard.state = state;
        info!(
            records = guard.state.record_count,
            bytes = guard.state.total_len,
            checksum = guard.state.checksum,
            "Sealed segment"
        );
        Ok(guard.state.meta())
    }

    async fn read_all(&self, id: &SegmentId) -> Result<SegmentRead, StorageError> {
        let (bytes, sealed) = self.load_bytes(id).await?;
        let read = read_bytes(*id, &bytes, sealed);
        for corrupt in &read.report.corrupt {
            warn!(
                segment = %id,
                index = corrupt.index,
                offset = corrupt.offset,
                stored_crc = corrupt.stored_crc,
                computed_crc = corrupt.computed_crc,
                "Corrupt frame excluded"
            );
        }
        Ok(read)
    }

    async fn scan(&self, id: &SegmentId) -> Result<FrameScan, StorageError> {
        let (bytes, _) = self.load_bytes(id).await?;
        Ok(frame::scan(&bytes))
    }

    async fn meta(&self, id: &SegmentId) -> Result<SegmentMeta, StorageError> {
        let handle = self.handle(id).await?;
        let guard = handle.lock().await;
        Ok(guard.state.meta())
    }

    async fn list(&self, partition: &PartitionKey) -> Result<Vec<SegmentMeta>, StorageError> {
        let dir = self.partition_dir(partition);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let ordinal = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok());
            match ordinal {
                Some(ordinal) => ids.push(SegmentId::new(*partition, ordinal)),
                None => warn!(path = %path.display(), "Ignoring unrecognized segment file"),
            }
        }
        ids.sort();

        let mut metas = Vec::with_capacity(ids.len());
        for id in ids {
            metas.push(self.meta(&id).await?);
        }
        Ok(metas)
    }

    #[instrument(skip(self), fields(segment = %id))]
    async fn truncate_at(&self, id: &SegmentId, byte_offset: u64) -> Result<SegmentMeta, StorageError> {
        let handle = self.handle(id).await?;
        let mut guard = handle.lock().await;

        if guard.state.sealed {
            return Err(StorageError::SegmentSealed(id.to_string()));
        }

        guard.writer = None;
        let len = byte_offset.min(guard.state.total_len);
        set_file_len(&guard.path, len).await?;

        let bytes = fs::read(&guard.path).await?;
        guard.state = SegmentState::from_bytes(*id, &bytes, false);
        warn!(truncated_to = len, "Segment truncated");
        Ok(guard.state.meta())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn segment() -> SegmentId {
        SegmentId::first(PartitionKey::main(
            NaiveDate::from_ymd_opt(2026, 1, 28).unwrap(),
        ))
    }

    async fn create_test_store() -> (FileSegmentStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSegmentStore::open(FileSegmentStoreConfig::with_base_dir(temp_dir.path()))
            .await
            .unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_layout_on_disk() {
        let (store, temp) = create_test_store().await;
        let id = segment();
        store.create(&id).await.unwrap();
        store.append(&id, b"x").await.unwrap();
        store.seal(&id).await.unwrap();

        let dir = temp.path().join("2026-01-28.main");
        assert!(dir.join("000001.seg").exists());
        assert!(dir.join("000001.sealed").exists());
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let (store, _temp) = create_test_store().await;
        store.create(&segment()).await.unwrap();
        assert!(matches!(
            store.create(&segment()).await,
            Err(StorageError::SegmentExists(_))
        ));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let (store, temp) = create_test_store().await;
        let id = segment();
        store.create(&id).await.unwrap();
        for i in 0..5u8 {
            store.append(&id, &[i; 16]).await.unwrap();
        }
        let before = store.seal(&id).await.unwrap();
        drop(store);

        let reopened = FileSegmentStore::open(FileSegmentStoreConfig::with_base_dir(temp.path()))
            .await
            .unwrap();
        let after = reopened.meta(&id).await.unwrap();
        assert_eq!(after, before);
        assert!(after.sealed);
        assert!(matches!(
            reopened.append(&id, b"late").await,
            Err(StorageError::SegmentSealed(_))
        ));
    }

    #[tokio::test]
    async fn test_crash_tail_truncated_on_next_append() {
        let (store, temp) = create_test_store().await;
        let id = segment();
        store.create(&id).await.unwrap();
        store.append(&id, b"first").await.unwrap();
        drop(store);

        // Simulate a torn write
        let path = temp.path().join("2026-01-28.main").join("000001.seg");
        let mut bytes = std::fs::read(&path).unwrap();
        let torn = frame::encode(b"second, never finished").unwrap();
        bytes.extend_from_slice(&torn[..12]);
        std::fs::write(&path, &bytes).unwrap();

        let store = FileSegmentStore::open(FileSegmentStoreConfig::with_base_dir(temp.path()))
            .await
            .unwrap();
        let read = store.read_all(&id).await.unwrap();
        assert_eq!(read.frames.len(), 1);
        assert_eq!(read.report.crash_tail_bytes(), 12);

        let at = store.append(&id, b"third").await.unwrap();
        assert_eq!(at.index, 1);
        assert_eq!(at.offset, frame::encoded_len(5) as u64);

        let read = store.read_all(&id).await.unwrap();
        let payloads: Vec<_> = read.frames.iter().map(|f| f.payload.to_vec()).collect();
        assert_eq!(payloads, vec![b"first".to_vec(), b"third".to_vec()]);
        assert!(read.report.is_clean());
    }

    #[tokio::test]
    async fn test_failed_write_is_not_acknowledged() {
        let (store, temp) = create_test_store().await;
        let id = segment();
        store.create(&id).await.unwrap();
        store.append(&id, b"first").await.unwrap();

        // Swap in a read-only writer so the next append fails
        let path = store.segment_path(&id);
        {
            let handle = store.handle(&id).await.unwrap();
            let mut guard = handle.lock().await;
            guard.writer = Some(File::open(&path).await.unwrap());
        }
        assert!(store.append(&id, b"second").await.is_err());
        assert_eq!(store.meta(&id).await.unwrap().record_count, 1);

        let at = store.append(&id, b"third").await.unwrap();
        assert_eq!(at.index, 1);
        assert_eq!(at.offset, frame::encoded_len(5) as u64);
        drop(store);

        let reopened = FileSegmentStore::open(FileSegmentStoreConfig::with_base_dir(temp.path()))
            .await
            .unwrap();
        let read = reopened.read_all(&id).await.unwrap();
        let payloads: Vec<_> = read.frames.iter().map(|f| f.payload.to_vec()).collect();
        assert_eq!(payloads, vec![b"first".to_vec(), b"third".to_vec()]);
        assert!(read.report.is_clean());
    }

    #[tokio::test]
    async fn test_unacknowledged_complete_frame_dropped() {
        let (store, _temp) = create_test_store().await;
        let id = segment();
        store.create(&id).await.unwrap();
        store.append(&id, b"first").await.unwrap();

        // A whole frame written but never acknowledged, e.g. a failed sync
        let path = store.segment_path(&id);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&frame::encode(b"ghost").unwrap());
        std::fs::write(&path, &bytes).unwrap();

        let at = store.append(&id, b"third").await.unwrap();
        assert_eq!(at.index, 1);

        let read = store.read_all(&id).await.unwrap();
        let payloads: Vec<_> = read.frames.iter().map(|f| f.payload.to_vec()).collect();
        assert_eq!(payloads, vec![b"first".to_vec(), b"third".to_vec()]);
        assert_eq!(store.meta(&id).await.unwrap().record_count, 2);
    }

    #[tokio::test]
    async fn test_partition_directory_synced() {
        let (store, temp) = create_test_store().await;
        let id = segment();
        store.create(&id).await.unwrap();
        store.seal(&id).await.unwrap();
        sync_dir(&temp.path().join("2026-01-28.main")).await.unwrap();
        assert!(sync_dir(&temp.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_is_ordered() {
        let (store, _temp) = create_test_store().await;
        let first = segment();
        store.create(&first.next()).await.unwrap();
        store.create(&first).await.unwrap();

        let listed = store.list(&first.partition).await.unwrap();
        let ordinals: Vec<_> = listed.iter().map(|m| m.id.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);

        let other = PartitionKey::late(first.partition.date);
        assert!(store.list(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_segment_not_found() {
        let (store, _temp) = create_test_store().await;
        assert!(matches!(
            store.meta(&segment()).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
