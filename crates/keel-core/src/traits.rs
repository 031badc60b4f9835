//! Core traits for Keel
//!
//! ## Key Traits
//!
//! - [`Downstream`]: The processing system the ledger propagates to and
//!   reconciles against
//! - [`Clock`]: Time abstraction for testability

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{AckId, SignalEnvelope, SignalId};
use crate::error::DownstreamError;
use crate::partition::PartitionKey;

/// One envelope handed to the downstream system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Partition the envelope was admitted to
    pub partition: PartitionKey,
    /// Ledger sequence within the partition
    pub sequence: u64,
    /// Acknowledgment id issued at ingest
    pub ack_id: AckId,
    /// The envelope itself
    pub envelope: SignalEnvelope,
}

impl Delivery {
    /// Signal id of the delivered envelope
    pub fn signal_id(&self) -> &SignalId {
        &self.envelope.signal_id
    }
}

/// The downstream processing system
///
/// The ledger is the source of truth; the downstream is queried for the ids
/// it has acknowledged and receives (re-)deliveries. Implementations must
/// treat `deliver` as idempotent: delivering the same envelope twice has the
/// same effect as delivering it once.
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Ids the downstream has acknowledged for a partition
    async fn processed_ids(
        &self,
        partition: &PartitionKey,
    ) -> Result<BTreeSet<SignalId>, DownstreamError>;

    /// Deliver an envelope
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DownstreamError>;
}

/// Time abstraction for testability
///
/// This trait allows tests to control time, enabling deterministic
/// testing of admission windows and timestamps.
pub trait Clock: Send + Sync + Debug {
    /// Get the current UTC datetime
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Real clock implementation using system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            micros: AtomicI64::new(start.timestamp_micros()),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let delta = by.num_microseconds().unwrap_or(i64::MAX);
        self.micros.fetch_add(delta, Ordering::SeqCst);
    }

    /// Jump to an absolute instant
    pub fn set(&self, at: DateTime<Utc>) {
        self.micros.store(at.timestamp_micros(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.micros.load(Ordering::SeqCst)).unwrap_or_default()
    }
}
