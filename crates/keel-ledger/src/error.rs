//! Error types for the ledger

use thiserror::Error;

use keel_core::{DownstreamError, EnvelopeError, KeyError, PartitionKey, SignalId};
use keel_storage::{SegmentId, StorageError};

/// Errors that can occur in ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Downstream error outside of a reconcile run
    #[error("Downstream error: {0}")]
    Downstream(#[from] DownstreamError),

    /// Envelope failed validation
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),

    /// Unparseable partition or segment key
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    /// Write attempted on a sealed partition
    #[error("Partition is sealed: {0}")]
    PartitionSealed(PartitionKey),

    /// Partition has never been opened
    #[error("Partition not found: {0}")]
    PartitionNotFound(PartitionKey),

    /// Lifecycle transition not allowed
    #[error("Invalid transition for {partition}: {reason}")]
    InvalidTransition {
        partition: PartitionKey,
        reason: String,
    },

    /// Signal id already admitted to the partition
    #[error("{signal_id} already admitted to {partition} at sequence {sequence}")]
    AlreadyAdmitted {
        partition: PartitionKey,
        signal_id: SignalId,
        sequence: u64,
    },

    /// Segment does not belong to the partition
    #[error("Segment not found: {0}")]
    SegmentNotFound(SegmentId),

    /// No complete frame at the requested index
    #[error("Frame {index} not found in {segment}")]
    FrameNotFound { segment: SegmentId, index: u64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    pub(crate) fn invalid_transition(partition: PartitionKey, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            partition,
            reason: reason.into(),
        }
    }
}

/// Result type alias for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_error_display() {
        let key = PartitionKey::main(NaiveDate::from_ymd_opt(2026, 1, 28).unwrap());
        assert!(LedgerError::PartitionSealed(key).to_string().contains("2026-01-28.main"));

        let err = LedgerError::invalid_transition(key.late_sibling(), "LATE partitions never seal");
        assert!(err.to_string().contains("never seal"));
    }

    #[test]
    fn test_from_storage_error() {
        let err: LedgerError = StorageError::not_found("x").into();
        assert!(matches!(err, LedgerError::Storage(StorageError::NotFound(_))));
    }
}
