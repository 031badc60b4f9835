//! Structured catalog storage using redb
//!
//! This module provides queryable, mutable storage for:
//! - Partition records and seal manifests
//! - Acknowledgment records
//! - Reconciliation run history
//!
//! Unlike segments, the catalog supports updates.

mod ack_store;
mod partition_store;
mod reconcile_log;
mod tables;

pub use ack_store::{AckRecord, AckState, AckStore, Reservation};
pub use partition_store::{Manifest, PartitionCatalog, PartitionRecord, SegmentChecksum};
pub use reconcile_log::{ReconcileLog, ReconcileResult, ReconcileStatus, ReplayFailure};
pub use tables::{
    ACK_RECORDS, BatchWrite, MANIFESTS, PARTITIONS, PROCESSED, RECONCILE_RUNS, RedbStorage,
    RedbStorageConfig, ScanResults, Table,
};
