//! Binary frame codec
//!
//! Every record in a segment is written as one frame:
//!
//! ```text
//! offset 0: u32 big-endian  length (N)
//! offset 4: u32 big-endian  crc32(payload)
//! offset 8: N bytes         payload
//! ```
//!
//! Decoding is fail-closed. Bytes after the last complete frame (fewer than
//! eight header bytes, or fewer payload bytes than the header declares) are
//! crash-tail residue from an interrupted write: they are excluded from the
//! decoded frames and reported separately. A complete frame whose checksum
//! does not match is reported as corrupt and skipped, and scanning resumes
//! at the offset its own header declares.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Size of the length + checksum header
pub const FRAME_HEADER_LEN: usize = 8;

/// CRC32 (IEEE) of a payload
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Continue a CRC32 over more bytes
///
/// `extend_checksum(checksum(a), b) == checksum(a ++ b)`.
pub fn extend_checksum(previous: u32, bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(previous);
    hasher.update(bytes);
    hasher.finalize()
}

/// Encoded size of a frame carrying `payload_len` bytes
pub fn encoded_len(payload_len: usize) -> usize {
    FRAME_HEADER_LEN + payload_len
}

/// Encode a payload as a frame
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::with_capacity(encoded_len(payload.len()));
    encode_into(&mut buf, payload)?;
    Ok(buf)
}

/// Append an encoded frame to `buf`
///
/// Fails only for payloads of 4 GiB or more, which the length field cannot
/// describe.
pub fn encode_into(buf: &mut Vec<u8>, payload: &[u8]) -> Result<(), StorageError> {
    let len = u32::try_from(payload.len()).map_err(|_| StorageError::FrameTooLarge(payload.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&checksum(payload).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// A complete frame with a verified checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Position among complete frames in the stream (corrupt ones included)
    pub index: u64,
    /// Byte offset of the frame header
    pub offset: u64,
    /// Stored (and verified) checksum
    pub crc32: u32,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Total encoded size of this frame
    pub fn encoded_len(&self) -> u64 {
        encoded_len(self.payload.len()) as u64
    }
}

/// A complete frame as found on disk, before checksum filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFrame {
    pub index: u64,
    pub offset: u64,
    pub stored_crc: u32,
    pub computed_crc: u32,
    pub payload: Bytes,
}

impl ScannedFrame {
    /// Whether the stored checksum matches the payload
    pub fn crc_ok(&self) -> bool {
        self.stored_crc == self.computed_crc
    }
}

/// A complete frame whose checksum did not match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptFrame {
    pub index: u64,
    pub offset: u64,
    pub declared_len: u32,
    pub stored_crc: u32,
    pub computed_crc: u32,
}

/// Trailing bytes that do not form a complete frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashTail {
    /// Offset where the incomplete frame starts
    pub offset: u64,
    /// Number of residue bytes
    pub len: u64,
    /// Payload length from the header, if the header itself was complete
    pub declared_len: Option<u32>,
}

/// Diagnostics produced while decoding a stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeReport {
    /// Complete frames excluded for checksum mismatch
    pub corrupt: Vec<CorruptFrame>,
    /// Incomplete trailing bytes, if any
    pub crash_tail: Option<CrashTail>,
    /// Bytes covered by complete frames (valid or corrupt)
    pub complete_len: u64,
}

impl DecodeReport {
    /// No corruption and no crash tail
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.crash_tail.is_none()
    }

    /// Residue bytes in the crash tail (0 when absent)
    pub fn crash_tail_bytes(&self) -> u64 {
        self.crash_tail.as_ref().map(|t| t.len).unwrap_or(0)
    }

    /// Fold another segment's report into this one
    pub fn merge(&mut self, other: &DecodeReport) {
        self.corrupt.extend(other.corrupt.iter().cloned());
        if self.crash_tail.is_none() {
            self.crash_tail = other.crash_tail.clone();
        }
        self.complete_len += other.complete_len;
    }
}

/// Every complete frame in a stream plus the crash tail
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameScan {
    pub frames: Vec<ScannedFrame>,
    pub crash_tail: Option<CrashTail>,
    /// End offset of the last complete frame
    pub complete_len: u64,
}

impl FrameScan {
    /// Frame at a position, with its checksum verdict
    pub fn get(&self, index: u64) -> Option<&ScannedFrame> {
        usize::try_from(index).ok().and_then(|i| self.frames.get(i))
    }
}

/// Valid frames plus the diagnostics for everything excluded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedStream {
    pub frames: Vec<Frame>,
    pub report: DecodeReport,
}

/// Scan a byte stream into complete frames
pub fn scan(bytes: &[u8]) -> FrameScan {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    let mut index = 0u64;

    let crash_tail = loop {
        let remaining = bytes.len() - pos;
        if remaining == 0 {
            break None;
        }
        if remaining < FRAME_HEADER_LEN {
            break Some(CrashTail {
                offset: pos as u64,
                len: remaining as u64,
                declared_len: None,
            });
        }

        let declared_len = read_u32(&bytes[pos..pos + 4]);
        let stored_crc = read_u32(&bytes[pos + 4..pos + 8]);
        let payload_start = pos + FRAME_HEADER_LEN;
        let available = bytes.len() - payload_start;
        if (declared_len as usize) > available {
            break Some(CrashTail {
                offset: pos as u64,
                len: remaining as u64,
                declared_len: Some(declared_len),
            });
        }

        let payload = &bytes[payload_start..payload_start + declared_len as usize];
        frames.push(ScannedFrame {
            index,
            offset: pos as u64,
            stored_crc,
            computed_crc: checksum(payload),
            payload: Bytes::copy_from_slice(payload),
        });

        index += 1;
        pos = payload_start + declared_len as usize;
    };

    FrameScan {
        frames,
        crash_tail,
        complete_len: pos as u64,
    }
}

/// Decode a byte stream, excluding corrupt frames and crash-tail residue
pub fn decode_stream(bytes: &[u8]) -> DecodedStream {
    let scan = scan(bytes);
    let mut decoded = DecodedStream {
        frames: Vec::with_capacity(scan.frames.len()),
        report: DecodeReport {
            corrupt: Vec::new(),
            crash_tail: scan.crash_tail,
            complete_len: scan.complete_len,
        },
    };

    for frame in scan.frames {
        if frame.crc_ok() {
            decoded.frames.push(Frame {
                index: frame.index,
                offset: frame.offset,
                crc32: frame.stored_crc,
                payload: frame.payload,
            });
        } else {
            decoded.report.corrupt.push(CorruptFrame {
                index: frame.index,
                offset: frame.offset,
                declared_len: frame.payload.len() as u32,
                stored_crc: frame.stored_crc,
                computed_crc: frame.computed_crc,
            });
        }
    }

    decoded
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}
