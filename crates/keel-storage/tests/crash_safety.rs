//! Crash-safety tests for segment storage
//!
//! Torn writes are simulated by truncating segment files at arbitrary byte
//! offsets, then reopening the store as a restarted process would.

use chrono::NaiveDate;
use keel_core::PartitionKey;
use keel_storage::frame::{self, FRAME_HEADER_LEN};
use keel_storage::{
    FileSegmentStore, FileSegmentStoreConfig, InMemorySegmentStore, SegmentId, SegmentStore,
    StorageError,
};
use tempfile::TempDir;

fn segment() -> SegmentId {
    SegmentId::first(PartitionKey::main(
        NaiveDate::from_ymd_opt(2026, 1, 28).unwrap(),
    ))
}

/// Payload sizes producing 500, 480 and 520 byte frames
fn payloads() -> Vec<Vec<u8>> {
    [500usize, 480, 520]
        .iter()
        .enumerate()
        .map(|(i, total)| vec![i as u8 + 1; total - FRAME_HEADER_LEN])
        .collect()
}

async fn open_store(dir: &TempDir) -> FileSegmentStore {
    FileSegmentStore::open(FileSegmentStoreConfig::with_base_dir(dir.path()))
        .await
        .unwrap()
}

// ============================================================================
// Truncation scenarios
// ============================================================================

#[tokio::test]
async fn test_truncated_inside_third_payload() {
    let dir = TempDir::new().unwrap();
    let id = segment();
    {
        let store = open_store(&dir).await;
        store.create(&id).await.unwrap();
        for payload in payloads() {
            store.append(&id, &payload).await.unwrap();
        }
        assert_eq!(store.meta(&id).await.unwrap().byte_size, 1500);

        // Header of the third frame plus 200 of its 512 payload bytes
        store.truncate_at(&id, 988 + 200).await.unwrap();
    }

    let store = open_store(&dir).await;
    let read = store.read_all(&id).await.unwrap();
    assert_eq!(read.frames.len(), 2);
    assert_eq!(read.frames[1].offset, 500);

    let tail = read.report.crash_tail.clone().unwrap();
    assert_eq!(tail.offset, 980);
    assert_eq!(tail.len, 208);
    assert_eq!(tail.declared_len, Some(512));
    assert!(read.report.corrupt.is_empty());
}

#[tokio::test]
async fn test_truncated_after_third_header() {
    let dir = TempDir::new().unwrap();
    let id = segment();
    {
        let store = open_store(&dir).await;
        store.create(&id).await.unwrap();
        for payload in payloads() {
            store.append(&id, &payload).await.unwrap();
        }
        store.truncate_at(&id, 988).await.unwrap();
    }

    let store = open_store(&dir).await;
    let read = store.read_all(&id).await.unwrap();
    assert_eq!(read.frames.len(), 2);
    assert_eq!(read.report.crash_tail_bytes(), 8);
    assert_eq!(read.meta.record_count, 2);
}

#[tokio::test]
async fn test_every_truncation_point_is_fail_closed() {
    let store = InMemorySegmentStore::new();
    let id = segment();
    let payloads = payloads();
    let boundaries = [0u64, 500, 980, 1500];

    for cut in 0..=1500u64 {
        let _ = store.truncate_at(&id, 0).await;
        if store.meta(&id).await.is_err() {
            store.create(&id).await.unwrap();
        }
        for payload in &payloads {
            store.append(&id, payload).await.unwrap();
        }
        store.truncate_at(&id, cut).await.unwrap();

        let read = store.read_all(&id).await.unwrap();
        let complete = boundaries.iter().filter(|b| **b != 0 && **b <= cut).count();
        assert_eq!(read.frames.len(), complete, "cut at {cut}");
        for frame in &read.frames {
            assert_eq!(frame.payload.as_ref(), payloads[frame.index as usize].as_slice());
        }
        assert_eq!(
            read.report.crash_tail.is_some(),
            !boundaries.contains(&cut),
            "cut at {cut}"
        );
    }
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_append_after_crash_replaces_tail() {
    let dir = TempDir::new().unwrap();
    let id = segment();
    {
        let store = open_store(&dir).await;
        store.create(&id).await.unwrap();
        for payload in payloads() {
            store.append(&id, &payload).await.unwrap();
        }
        store.truncate_at(&id, 1188).await.unwrap();
    }

    let store = open_store(&dir).await;
    let at = store.append(&id, b"after restart").await.unwrap();
    assert_eq!(at.index, 2);
    assert_eq!(at.offset, 980);

    let read = store.read_all(&id).await.unwrap();
    assert!(read.report.is_clean());
    assert_eq!(read.frames.len(), 3);
    assert_eq!(read.frames[2].payload.as_ref(), b"after restart");

    let on_disk = std::fs::read(store.segment_path(&id)).unwrap();
    assert_eq!(on_disk.len() as u64, read.meta.byte_size);
    assert_eq!(frame::checksum(&on_disk), read.meta.checksum);
}

#[tokio::test]
async fn test_torn_bytes_behind_a_live_handle() {
    let dir = TempDir::new().unwrap();
    let id = segment();
    let first = {
        let store = open_store(&dir).await;
        store.create(&id).await.unwrap();
        store.append(&id, b"first").await.unwrap();

        // A write that failed halfway, while the store keeps running
        let path = dir.path().join("2026-01-28.main").join("000001.seg");
        let torn = frame::encode(b"second, never acknowledged").unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, &torn[..12]).unwrap();
        drop(file);

        let third = store.append(&id, b"third").await.unwrap();
        assert_eq!(third.index, 1);
        assert_eq!(third.offset, frame::encoded_len(5) as u64);
        store.meta(&id).await.unwrap()
    };

    let store = open_store(&dir).await;
    let read = store.read_all(&id).await.unwrap();
    let payloads: Vec<_> = read.frames.iter().map(|f| f.payload.to_vec()).collect();
    assert_eq!(payloads, vec![b"first".to_vec(), b"third".to_vec()]);
    assert_eq!(read.report.crash_tail_bytes(), 0);
    assert_eq!(read.meta.record_count, first.record_count);
    assert_eq!(read.meta.byte_size, first.byte_size);
}

#[tokio::test]
async fn test_sealed_segment_keeps_its_tail() {
    let store = InMemorySegmentStore::new();
    let id = segment();
    store.create(&id).await.unwrap();
    store.append(&id, b"complete").await.unwrap();
    store.inject_raw(&id, &[0, 0, 1]).unwrap();

    let sealed = store.seal(&id).await.unwrap();
    assert_eq!(sealed.record_count, 1);

    assert!(matches!(
        store.append(&id, b"more").await,
        Err(StorageError::SegmentSealed(_))
    ));
    let read = store.read_all(&id).await.unwrap();
    assert_eq!(read.report.crash_tail_bytes(), 3);
    assert_eq!(read.meta.byte_size, sealed.byte_size);
}

#[tokio::test]
async fn test_corrupt_frame_on_disk_is_excluded() {
    let dir = TempDir::new().unwrap();
    let id = segment();
    let store = open_store(&dir).await;
    store.create(&id).await.unwrap();
    for payload in payloads() {
        store.append(&id, &payload).await.unwrap();
    }
    store.seal(&id).await.unwrap();
    drop(store);

    let path = dir.path().join("2026-01-28.main").join("000001.seg");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[500 + FRAME_HEADER_LEN + 10] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let store = open_store(&dir).await;
    let read = store.read_all(&id).await.unwrap();
    let indices: Vec<_> = read.frames.iter().map(|f| f.index).collect();
    assert_eq!(indices, vec![0, 2]);
    assert_eq!(read.report.corrupt.len(), 1);
    assert_eq!(read.report.corrupt[0].offset, 500);

    let scan = store.scan(&id).await.unwrap();
    assert!(!scan.get(1).unwrap().crc_ok());
}
