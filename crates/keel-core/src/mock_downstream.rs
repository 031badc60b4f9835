//! Mock downstream implementation for testing
//!
//! Provides an in-memory downstream processing system with fault injection,
//! for exercising ingestion propagation and reconciliation without a real
//! consumer.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keel_core::{MockDownstream, PartitionKey, SignalId};
//!
//! let downstream = MockDownstream::new();
//! downstream.acknowledge(&key, SignalId::new("sig-1"));
//!
//! // Next two deliveries of sig-2 are refused, the third succeeds
//! downstream.fail_times(&SignalId::new("sig-2"), 2);
//!
//! // Simulate an outage
//! downstream.set_reachable(false);
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::envelope::SignalId;
use crate::error::DownstreamError;
use crate::partition::PartitionKey;
use crate::traits::{Delivery, Downstream};

/// In-memory downstream with configurable failures
#[derive(Debug)]
pub struct MockDownstream {
    /// Acknowledged ids per partition
    processed: DashMap<PartitionKey, BTreeSet<SignalId>>,
    /// Delivery attempts that reached the downstream, per id
    deliveries: DashMap<SignalId, u32>,
    /// Remaining injected failures per id
    failures: DashMap<SignalId, u32>,
    /// Ids whose deliveries are accepted but never acknowledged
    black_holed: DashSet<SignalId>,
    /// Whether the downstream answers at all
    reachable: AtomicBool,
    /// Artificial latency for every call
    delay_millis: AtomicU64,
}

impl Default for MockDownstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDownstream {
    /// Create a reachable downstream with nothing processed
    pub fn new() -> Self {
        Self {
            processed: DashMap::new(),
            deliveries: DashMap::new(),
            failures: DashMap::new(),
            black_holed: DashSet::new(),
            reachable: AtomicBool::new(true),
            delay_millis: AtomicU64::new(0),
        }
    }

    /// Record an id as processed without a delivery
    pub fn acknowledge(&self, partition: &PartitionKey, signal_id: SignalId) {
        self.processed
            .entry(*partition)
            .or_default()
            .insert(signal_id);
    }

    /// Remove an id from the processed set (simulates downstream data loss)
    pub fn forget(&self, partition: &PartitionKey, signal_id: &SignalId) -> bool {
        self.processed
            .get_mut(partition)
            .map(|mut ids| ids.remove(signal_id))
            .unwrap_or(false)
    }

    /// Toggle reachability
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Refuse the next `times` deliveries of an id
    pub fn fail_times(&self, signal_id: &SignalId, times: u32) {
        self.failures.insert(signal_id.clone(), times);
    }

    /// Accept deliveries of an id without ever acknowledging it
    pub fn black_hole(&self, signal_id: &SignalId) {
        self.black_holed.insert(signal_id.clone());
    }

    /// Add latency to every call
    pub fn set_delay(&self, delay: Duration) {
        self.delay_millis
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of deliveries that reached the downstream for an id
    pub fn delivery_count(&self, signal_id: &SignalId) -> u32 {
        self.deliveries.get(signal_id).map(|c| *c).unwrap_or(0)
    }

    /// Number of processed ids in a partition
    pub fn processed_count(&self, partition: &PartitionKey) -> usize {
        self.processed.get(partition).map(|ids| ids.len()).unwrap_or(0)
    }

    /// Whether an id is processed in a partition
    pub fn is_processed(&self, partition: &PartitionKey, signal_id: &SignalId) -> bool {
        self.processed
            .get(partition)
            .map(|ids| ids.contains(signal_id))
            .unwrap_or(false)
    }

    async fn simulate_latency(&self) {
        let millis = self.delay_millis.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    fn check_reachable(&self) -> Result<(), DownstreamError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DownstreamError::Unreachable("mock downstream offline".into()))
        }
    }

    /// Consume one injected failure for an id, if any remain
    fn take_failure(&self, signal_id: &SignalId) -> bool {
        match self.failures.get_mut(signal_id) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Downstream for MockDownstream {
    async fn processed_ids(
        &self,
        partition: &PartitionKey,
    ) -> Result<BTreeSet<SignalId>, DownstreamError> {
        self.simulate_latency().await;
        self.check_reachable()?;
        Ok(self
            .processed
            .get(partition)
            .map(|ids| ids.clone())
            .unwrap_or_default())
    }

    async fn deliver(&self, delivery: &Delivery) -> Result<(), DownstreamError> {
        self.simulate_latency().await;
        self.check_reachable()?;

        let signal_id = delivery.signal_id();
        *self.deliveries.entry(signal_id.clone()).or_insert(0) += 1;

        if self.take_failure(signal_id) {
            return Err(DownstreamError::Rejected {
                signal_id: signal_id.to_string(),
                reason: "injected failure".into(),
            });
        }

        if !self.black_holed.contains(signal_id) {
            self.acknowledge(&delivery.partition, signal_id.clone());
        }
        Ok(())
    }
}
