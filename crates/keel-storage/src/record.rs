//! Ledger record payload
//!
//! Each frame in a segment carries one postcard-encoded [`LedgerRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::SignalEnvelope;

use crate::error::StorageError;

/// One admitted envelope together with its ledger position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Sequence number within the partition (1-based, strictly increasing)
    pub sequence: u64,
    /// When the ledger admitted the envelope
    pub admitted_at: DateTime<Utc>,
    /// The admitted envelope
    pub envelope: SignalEnvelope,
}

impl LedgerRecord {
    pub fn new(sequence: u64, admitted_at: DateTime<Utc>, envelope: SignalEnvelope) -> Self {
        Self {
            sequence,
            admitted_at,
            envelope,
        }
    }

    /// Encode as a frame payload
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        postcard::to_allocvec(self).map_err(|e| StorageError::serialization(e.to_string()))
    }

    /// Decode a frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, StorageError> {
        Ok(postcard::from_bytes(payload)?)
    }
}
