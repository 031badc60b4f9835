//! Segments: append-only runs of frames within a partition
//!
//! A partition's records are spread over one or more segments, addressed by
//! [`SegmentId`]. Only the newest segment of an open partition accepts
//! appends; sealing a segment is one-way and never rewrites its bytes.

mod file;
mod memory;

pub use file::{FileSegmentStore, FileSegmentStoreConfig};
pub use memory::InMemorySegmentStore;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use keel_core::{KeyError, PartitionKey};

use crate::frame::{self, DecodeReport, Frame};

/// Segment address: partition key plus a 1-based ordinal
///
/// Renders as `2026-01-28.main.000001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SegmentId {
    pub partition: PartitionKey,
    pub ordinal: u32,
}

impl SegmentId {
    pub fn new(partition: PartitionKey, ordinal: u32) -> Self {
        Self { partition, ordinal }
    }

    /// First segment of a partition
    pub fn first(partition: PartitionKey) -> Self {
        Self::new(partition, 1)
    }

    /// The segment that follows this one
    pub fn next(&self) -> Self {
        Self::new(self.partition, self.ordinal + 1)
    }

    /// File stem used by the file backend (`000001`)
    pub fn stem(&self) -> String {
        format!("{:06}", self.ordinal)
    }

    /// Segment data file name (`000001.seg`)
    pub fn file_name(&self) -> String {
        format!("{}.seg", self.stem())
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.partition, self.ordinal)
    }
}

impl FromStr for SegmentId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (partition, ordinal) = s
            .rsplit_once('.')
            .ok_or_else(|| KeyError::InvalidKey(s.to_string()))?;
        let ordinal = ordinal
            .parse::<u32>()
            .map_err(|_| KeyError::InvalidKey(s.to_string()))?;
        Ok(Self::new(partition.parse()?, ordinal))
    }
}

impl From<SegmentId> for String {
    fn from(id: SegmentId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SegmentId {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Metadata describing a segment's current contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub id: SegmentId,
    pub file_name: String,
    /// Frames that decode with a valid checksum
    pub record_count: u64,
    /// Every stored byte, crash-tail residue included
    pub byte_size: u64,
    /// Rolling CRC32 over every stored byte
    pub checksum: u32,
    pub sealed: bool,
}

/// Location of an appended frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameOffset {
    pub segment: SegmentId,
    /// Position among the segment's complete frames
    pub index: u64,
    /// Byte offset of the frame header
    pub offset: u64,
}

/// Result of reading a whole segment
///
/// `meta` is recomputed from the bytes just read, so it reflects the
/// segment as it is on storage rather than as it was last appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRead {
    pub meta: SegmentMeta,
    pub frames: Vec<Frame>,
    pub report: DecodeReport,
}

/// Bookkeeping shared by the segment backends
#[derive(Debug, Clone)]
pub(crate) struct SegmentState {
    pub id: SegmentId,
    /// Complete frames, valid or corrupt
    pub frame_count: u64,
    pub record_count: u64,
    /// End of the last complete frame
    pub complete_len: u64,
    pub total_len: u64,
    pub checksum: u32,
    pub sealed: bool,
}

impl SegmentState {
    pub fn empty(id: SegmentId) -> Self {
        Self {
            id,
            frame_count: 0,
            record_count: 0,
            complete_len: 0,
            total_len: 0,
            checksum: 0,
            sealed: false,
        }
    }

    /// Rebuild state by scanning stored bytes
    pub fn from_bytes(id: SegmentId, bytes: &[u8], sealed: bool) -> Self {
        let scan = frame::scan(bytes);
        Self {
            id,
            frame_count: scan.frames.len() as u64,
            record_count: scan.frames.iter().filter(|f| f.crc_ok()).count() as u64,
            complete_len: scan.complete_len,
            total_len: bytes.len() as u64,
            checksum: frame::checksum(bytes),
            sealed,
        }
    }

    /// Bytes after the last complete frame
    pub fn tail_len(&self) -> u64 {
        self.total_len - self.complete_len
    }

    /// Account for a frame written at the current end
    pub fn record_append(&mut self, encoded: &[u8]) -> FrameOffset {
        let offset = FrameOffset {
            segment: self.id,
            index: self.frame_count,
            offset: self.total_len,
        };
        self.frame_count += 1;
        self.record_count += 1;
        self.total_len += encoded.len() as u64;
        self.complete_len = self.total_len;
        self.checksum = frame::extend_checksum(self.checksum, encoded);
        offset
    }

    pub fn meta(&self) -> SegmentMeta {
        SegmentMeta {
            id: self.id,
            file_name: self.id.file_name(),
            record_count: self.record_count,
            byte_size: self.total_len,
            checksum: self.checksum,
            sealed: self.sealed,
        }
    }
}

/// Decode stored bytes into a [`SegmentRead`]
pub(crate) fn read_bytes(id: SegmentId, bytes: &[u8], sealed: bool) -> SegmentRead {
    let decoded = frame::decode_stream(bytes);
    let mut state = SegmentState::from_bytes(id, bytes, sealed);
    state.record_count = decoded.frames.len() as u64;
    SegmentRead {
        meta: state.meta(),
        frames: decoded.frames,
        report: decoded.report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn partition() -> PartitionKey {
        PartitionKey::main(NaiveDate::from_ymd_opt(2026, 1, 28).unwrap())
    }

    #[test]
    fn test_segment_id_display_and_parse() {
        let id = SegmentId::first(partition());
        assert_eq!(id.to_string(), "2026-01-28.main.000001");
        assert_eq!(id.file_name(), "000001.seg");
        assert_eq!("2026-01-28.main.000001".parse::<SegmentId>().unwrap(), id);
        assert_eq!(id.next().ordinal, 2);
    }

    #[test]
    fn test_segment_id_parse_errors() {
        assert!("2026-01-28.main".parse::<SegmentId>().is_err());
        assert!("2026-01-28.main.abc".parse::<SegmentId>().is_err());
        assert!("nonsense".parse::<SegmentId>().is_err());
    }

    #[test]
    fn test_state_tracks_appends_like_a_rescan() {
        let id = SegmentId::first(partition());
        let mut state = SegmentState::empty(id);
        let mut bytes = Vec::new();
        for payload in [&b"a"[..], b"bb", b"ccc"] {
            let encoded = frame::encode(payload).unwrap();
            let at = state.record_append(&encoded);
            assert_eq!(at.offset, bytes.len() as u64);
            bytes.extend_from_slice(&encoded);
        }

        let rescanned = SegmentState::from_bytes(id, &bytes, false);
        assert_eq!(rescanned.meta(), state.meta());
        assert_eq!(state.frame_count, 3);
    }

    #[test]
    fn test_state_from_bytes_with_tail() {
        let id = SegmentId::first(partition());
        let mut bytes = frame::encode(b"whole").unwrap();
        bytes.extend_from_slice(&[1, 2, 3]);

        let state = SegmentState::from_bytes(id, &bytes, false);
        assert_eq!(state.record_count, 1);
        assert_eq!(state.tail_len(), 3);
        assert_eq!(state.meta().byte_size, bytes.len() as u64);
    }
}
