//! Partition lifecycle
//!
//! The [`PartitionManager`] owns every partition's in-memory state behind a
//! per-partition `tokio::sync::Mutex`. `admit` and `seal` on one partition
//! are serialized by that lock; different partitions proceed independently.
//!
//! On startup the manager loads partition records from the catalog and
//! rebuilds each partition's admitted ids and highwater sequence by scanning
//! its segments, so a crash between a segment append and a catalog update
//! never loses an admitted record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use keel_core::{Clock, PartitionKey, PartitionStatus, PartitionType, SignalEnvelope, SignalId};
use keel_storage::frame::{self, DecodeReport};
use keel_storage::{
    LedgerRecord, Manifest, PartitionCatalog, PartitionRecord, SegmentChecksum, SegmentId,
    SegmentMeta, SegmentStore,
};

use crate::config::SegmentConfig;
use crate::error::{LedgerError, LedgerResult};

/// Externally visible summary of a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub key: PartitionKey,
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub kind: PartitionType,
    pub status: PartitionStatus,
    pub highwater_sequence: u64,
    pub record_count: u64,
    pub segment_count: usize,
    pub byte_size: u64,
    pub opened_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub manifest_revision: u32,
}

/// Filter for [`PartitionManager::list`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFilter {
    pub status: Option<PartitionStatus>,
    #[serde(rename = "type")]
    pub kind: Option<PartitionType>,
}

impl PartitionFilter {
    pub fn matches(&self, summary: &PartitionSummary) -> bool {
        self.status.is_none_or(|s| s == summary.status) && self.kind.is_none_or(|k| k == summary.kind)
    }
}

/// Decoded contents of a partition at one instant
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    pub key: PartitionKey,
    pub status: PartitionStatus,
    pub highwater_sequence: u64,
    pub records: Vec<LedgerRecord>,
    pub report: DecodeReport,
    /// Frames whose checksum matched but whose payload did not decode
    pub undecodable_frames: u64,
}

impl PartitionSnapshot {
    /// Ids of every decoded record
    pub fn signal_ids(&self) -> impl Iterator<Item = &SignalId> {
        self.records.iter().map(|r| &r.envelope.signal_id)
    }
}

/// Comparison of one segment against its manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentVerification {
    pub segment: SegmentId,
    pub expected_checksum: u32,
    pub actual_checksum: Option<u32>,
    pub expected_records: u64,
    pub actual_records: Option<u64>,
    pub ok: bool,
}

/// Result of re-checking a sealed partition against its manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestVerification {
    pub partition: PartitionKey,
    pub revision: u32,
    pub segments: Vec<SegmentVerification>,
    /// Segments on storage that the manifest does not list
    pub unlisted_segments: Vec<SegmentId>,
    pub ok: bool,
}

#[derive(Debug)]
struct PartitionState {
    record: PartitionRecord,
    /// Ordered; the last one is the only segment that accepts appends
    segments: Vec<SegmentMeta>,
    admitted: HashMap<SignalId, u64>,
}

impl PartitionState {
    fn summary(&self) -> PartitionSummary {
        PartitionSummary {
            key: self.record.key,
            date: self.record.key.date,
            kind: self.record.key.kind,
            status: self.record.status,
            highwater_sequence: self.record.highwater_sequence,
            record_count: self.segments.iter().map(|s| s.record_count).sum(),
            segment_count: self.segments.len(),
            byte_size: self.segments.iter().map(|s| s.byte_size).sum(),
            opened_at: self.record.opened_at,
            sealed_at: self.record.sealed_at,
            manifest_revision: self.record.manifest_revision,
        }
    }
}

type SharedState = Arc<Mutex<PartitionState>>;

/// Owner of partition lifecycle and the admission path
pub struct PartitionManager {
    segments: Arc<dyn SegmentStore>,
    catalog: PartitionCatalog,
    clock: Arc<dyn Clock>,
    max_segment_bytes: u64,
    partitions: DashMap<PartitionKey, SharedState>,
    /// Serializes partition creation
    open_lock: Mutex<()>,
}

impl std::fmt::Debug for PartitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionManager")
            .field("partitions", &self.partitions.len())
            .field("max_segment_bytes", &self.max_segment_bytes)
            .finish_non_exhaustive()
    }
}

impl PartitionManager {
    /// Create a manager; call [`recover`](Self::recover) before use
    pub fn new(
        segments: Arc<dyn SegmentStore>,
        catalog: PartitionCatalog,
        clock: Arc<dyn Clock>,
        config: &SegmentConfig,
    ) -> Self {
        Self {
            segments,
            catalog,
            clock,
            max_segment_bytes: config.max_segment_bytes,
            partitions: DashMap::new(),
            open_lock: Mutex::new(()),
        }
    }

    /// The segment store partitions write to
    pub fn segment_store(&self) -> &Arc<dyn SegmentStore> {
        &self.segments
    }

    /// Load every cataloged partition and rebuild its state from segments
    #[instrument(skip(self))]
    pub async fn recover(&self) -> LedgerResult<usize> {
        let records = self.catalog.list()?;
        let count = records.len();
        for record in records {
            let key = record.key;
            let state = self.load_state(record).await?;
            self.partitions.insert(key, Arc::new(Mutex::new(state)));
        }
        info!(partitions = count, "Recovered partitions");
        Ok(count)
    }

    async fn load_state(&self, mut record: PartitionRecord) -> LedgerResult<PartitionState> {
        let key = record.key;
        let segments = self.segments.list(&key).await?;
        let mut admitted = HashMap::new();
        let mut highwater = record.highwater_sequence;

        for meta in &segments {
            let read = self.segments.read_all(&meta.id).await?;
            if !read.report.is_clean() {
                warn!(
                    segment = %meta.id,
                    corrupt = read.report.corrupt.len(),
                    tail_bytes = read.report.crash_tail_bytes(),
                    "Segment needs attention"
                );
            }
            for frame in read.frames {
                match LedgerRecord::decode(&frame.payload) {
                    Ok(entry) => {
                        highwater = highwater.max(entry.sequence);
                        admitted.insert(entry.envelope.signal_id, entry.sequence);
                    }
                    Err(e) => {
                        warn!(segment = %meta.id, index = frame.index, error = %e, "Undecodable record")
                    }
                }
            }
        }

        record.highwater_sequence = highwater;
        debug!(
            partition = %key,
            segments = segments.len(),
            admitted = admitted.len(),
            highwater,
            "Loaded partition state"
        );
        Ok(PartitionState {
            record,
            segments,
            admitted,
        })
    }

    async fn state(&self, key: &PartitionKey) -> LedgerResult<SharedState> {
        if let Some(state) = self.partitions.get(key) {
            return Ok(Arc::clone(state.value()));
        }

        let record = self
            .catalog
            .get(key)?
            .ok_or(LedgerError::PartitionNotFound(*key))?;
        let loaded = Arc::new(Mutex::new(self.load_state(record).await?));
        Ok(self.partitions.entry(*key).or_insert(loaded).value().clone())
    }

    /// Open a partition, returning the existing one if already open
    #[instrument(skip(self), fields(partition = %key))]
    pub async fn open_partition(&self, key: PartitionKey) -> LedgerResult<PartitionSummary> {
        match self.state(&key).await {
            Ok(state) => return Ok(state.lock().await.summary()),
            Err(LedgerError::PartitionNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let _guard = self.open_lock.lock().await;
        if let Some(state) = self.partitions.get(&key).map(|s| Arc::clone(s.value())) {
            return Ok(state.lock().await.summary());
        }

        // Segments may survive a crash that happened before the catalog write
        if self.segments.list(&key).await?.is_empty() {
            self.segments.create(&SegmentId::first(key)).await?;
        }
        let record = PartitionRecord::open(key, self.clock.now_utc());
        self.catalog.put(&record)?;

        let state = self.load_state(record).await?;
        let summary = state.summary();
        self.partitions.insert(key, Arc::new(Mutex::new(state)));

        info!("Opened partition");
        Ok(summary)
    }

    /// Convenience for [`open_partition`](Self::open_partition) by parts
    pub async fn open(&self, date: NaiveDate, kind: PartitionType) -> LedgerResult<PartitionSummary> {
        self.open_partition(PartitionKey::new(date, kind)).await
    }

    /// Admit an envelope, returning its sequence number
    ///
    /// # Errors
    ///
    /// - [`LedgerError::PartitionSealed`] if the partition is sealed
    /// - [`LedgerError::AlreadyAdmitted`] if the id is already in the partition
    pub async fn admit(&self, key: &PartitionKey, envelope: &SignalEnvelope) -> LedgerResult<u64> {
        let state = self.state(key).await?;
        let mut state = state.lock().await;

        if state.record.status == PartitionStatus::Sealed {
            return Err(LedgerError::PartitionSealed(*key));
        }
        if let Some(sequence) = state.admitted.get(&envelope.signal_id) {
            return Err(LedgerError::AlreadyAdmitted {
                partition: *key,
                signal_id: envelope.signal_id.clone(),
                sequence: *sequence,
            });
        }

        let sequence = state.record.highwater_sequence + 1;
        let payload =
            LedgerRecord::new(sequence, self.clock.now_utc(), envelope.clone()).encode()?;

        let segment = self.writable_segment(&mut state, payload.len()).await?;
        let at = self.segments.append(&segment, &payload).await?;
        let meta = self.segments.meta(&segment).await?;
        if let Some(last) = state.segments.last_mut() {
            *last = meta;
        }

        state.record.highwater_sequence = sequence;
        state.admitted.insert(envelope.signal_id.clone(), sequence);

        debug!(
            partition = %key,
            signal_id = %envelope.signal_id,
            sequence,
            segment = %at.segment,
            index = at.index,
            "Admitted record"
        );
        Ok(sequence)
    }

    /// The open segment to append to, rotating when it is full
    async fn writable_segment(
        &self,
        state: &mut PartitionState,
        payload_len: usize,
    ) -> LedgerResult<SegmentId> {
        let key = state.record.key;
        let current = match state.segments.last() {
            Some(meta) => meta.clone(),
            None => {
                let meta = self.segments.create(&SegmentId::first(key)).await?;
                state.segments.push(meta.clone());
                meta
            }
        };

        let frame_len = frame::encoded_len(payload_len) as u64;
        let full = current.record_count > 0 && current.byte_size + frame_len > self.max_segment_bytes;
        if !current.sealed && !full {
            return Ok(current.id);
        }

        if !current.sealed {
            let sealed = self.segments.seal(&current.id).await?;
            if let Some(last) = state.segments.last_mut() {
                *last = sealed;
            }
        }
        let next = self.segments.create(&current.id.next()).await?;
        info!(partition = %key, segment = %next.id, "Rotated segment");
        let id = next.id;
        state.segments.push(next);
        Ok(id)
    }

    /// Seal a MAIN partition and write its manifest
    ///
    /// Sealing an already-sealed partition re-seals it: every segment is
    /// re-checked and a manifest with the next revision replaces the old one.
    #[instrument(skip(self), fields(partition = %key))]
    pub async fn seal(&self, key: &PartitionKey) -> LedgerResult<Manifest> {
        if !key.is_main() {
            return Err(LedgerError::invalid_transition(
                *key,
                "LATE partitions never seal",
            ));
        }

        let state = self.state(key).await?;
        let mut state = state.lock().await;

        let mut metas = Vec::with_capacity(state.segments.len());
        for meta in &state.segments {
            metas.push(self.segments.seal(&meta.id).await?);
        }

        let now = self.clock.now_utc();
        let revision = state.record.manifest_revision + 1;
        let manifest = Manifest {
            partition: *key,
            sealed_at: now,
            total_records: metas.iter().map(|m| m.record_count).sum(),
            highwater_sequence: state.record.highwater_sequence,
            revision,
            segments: metas.iter().map(SegmentChecksum::from).collect(),
        };
        if manifest.total_records != state.admitted.len() as u64 {
            warn!(
                total_records = manifest.total_records,
                admitted = state.admitted.len(),
                "Manifest record count differs from admitted ids"
            );
        }

        let mut record = state.record.clone();
        record.status = PartitionStatus::Sealed;
        record.sealed_at = record.sealed_at.or(Some(now));
        record.manifest_revision = revision;
        self.catalog.put_sealed(&record, &manifest)?;

        state.record = record;
        state.segments = metas;

        info!(
            revision,
            total_records = manifest.total_records,
            highwater = manifest.highwater_sequence,
            "Sealed partition"
        );
        Ok(manifest)
    }

    /// Seal every open MAIN partition whose date ended more than `grace` ago
    pub async fn seal_elapsed(&self, now: DateTime<Utc>, grace: Duration) -> LedgerResult<Vec<Manifest>> {
        let candidates = self
            .list(PartitionFilter {
                status: Some(PartitionStatus::Open),
                kind: Some(PartitionType::Main),
            })
            .await;

        let mut sealed = Vec::new();
        for summary in candidates {
            let Some(next_day) = summary.date.succ_opt() else {
                continue;
            };
            let closes_at = next_day
                .and_hms_opt(0, 0, 0)
                .and_then(|t| t.and_utc().checked_add_signed(grace));
            if closes_at.is_some_and(|closes_at| closes_at <= now) {
                sealed.push(self.seal(&summary.key).await?);
            }
        }
        Ok(sealed)
    }

    /// Recompute segment checksums and compare with the manifest
    #[instrument(skip(self), fields(partition = %key))]
    pub async fn verify(&self, key: &PartitionKey) -> LedgerResult<ManifestVerification> {
        let manifest = self
            .catalog
            .manifest(key)?
            .ok_or_else(|| LedgerError::invalid_transition(*key, "partition has no manifest"))?;

        let mut segments = Vec::with_capacity(manifest.segments.len());
        for entry in &manifest.segments {
            let (actual_checksum, actual_records) = match self.segments.read_all(&entry.segment).await {
                Ok(read) => (Some(read.meta.checksum), Some(read.meta.record_count)),
                Err(e) => {
                    warn!(segment = %entry.segment, error = %e, "Manifest segment unreadable");
                    (None, None)
                }
            };
            segments.push(SegmentVerification {
                segment: entry.segment,
                expected_checksum: entry.checksum,
                actual_checksum,
                expected_records: entry.record_count,
                actual_records,
                ok: actual_checksum == Some(entry.checksum)
                    && actual_records == Some(entry.record_count),
            });
        }

        let unlisted_segments: Vec<SegmentId> = self
            .segments
            .list(key)
            .await?
            .into_iter()
            .map(|m| m.id)
            .filter(|id| !manifest.segments.iter().any(|s| s.segment == *id))
            .collect();

        let ok = segments.iter().all(|s| s.ok) && unlisted_segments.is_empty();
        if !ok {
            warn!(revision = manifest.revision, "Manifest verification failed");
        }
        Ok(ManifestVerification {
            partition: *key,
            revision: manifest.revision,
            segments,
            unlisted_segments,
            ok,
        })
    }

    /// Decode every record of a partition under its lock
    pub async fn snapshot(&self, key: &PartitionKey) -> LedgerResult<PartitionSnapshot> {
        let state = self.state(key).await?;
        let state = state.lock().await;

        let mut records = Vec::new();
        let mut report = DecodeReport::default();
        let mut undecodable_frames = 0;
        for meta in &state.segments {
            let read = self.segments.read_all(&meta.id).await?;
            report.merge(&read.report);
            for frame in read.frames {
                match LedgerRecord::decode(&frame.payload) {
                    Ok(record) => records.push(record),
                    Err(_) => undecodable_frames += 1,
                }
            }
        }

        Ok(PartitionSnapshot {
            key: *key,
            status: state.record.status,
            highwater_sequence: state.record.highwater_sequence,
            records,
            report,
            undecodable_frames,
        })
    }

    /// Sequence of an admitted id, if present
    pub async fn admitted_sequence(
        &self,
        key: &PartitionKey,
        signal_id: &SignalId,
    ) -> LedgerResult<Option<u64>> {
        let state = self.state(key).await?;
        let state = state.lock().await;
        Ok(state.admitted.get(signal_id).copied())
    }

    /// Summary of one partition
    pub async fn summary(&self, key: &PartitionKey) -> LedgerResult<PartitionSummary> {
        let state = self.state(key).await?;
        let summary = state.lock().await.summary();
        Ok(summary)
    }

    /// Status of a partition, `None` if it was never opened
    pub async fn status(&self, key: &PartitionKey) -> LedgerResult<Option<PartitionStatus>> {
        match self.state(key).await {
            Ok(state) => Ok(Some(state.lock().await.record.status)),
            Err(LedgerError::PartitionNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Summaries of every known partition matching a filter, ordered by key
    pub async fn list(&self, filter: PartitionFilter) -> Vec<PartitionSummary> {
        let states: Vec<SharedState> = self
            .partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut summaries = Vec::with_capacity(states.len());
        for state in states {
            let summary = state.lock().await.summary();
            if filter.matches(&summary) {
                summaries.push(summary);
            }
        }
        summaries.sort_by_key(|s| s.key);
        summaries
    }

    /// Current manifest of a partition
    pub fn manifest(&self, key: &PartitionKey) -> LedgerResult<Option<Manifest>> {
        Ok(self.catalog.manifest(key)?)
    }

    /// Segment metadata of a partition, freshly read from the store
    pub async fn segments(&self, key: &PartitionKey) -> LedgerResult<Vec<SegmentMeta>> {
        // Ensure the partition exists
        self.state(key).await?;
        Ok(self.segments.list(key).await?)
    }
}
