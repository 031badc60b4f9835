//! Idempotent ingestion
//!
//! Ingest writes the ledger first and propagates second. The ack id is a
//! pure function of the signal id, and an ack record is reserved before the
//! ledger append, so a retry after a crash at any point either finds the
//! committed record (duplicate) or finishes the interrupted ingest without
//! appending twice.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use keel_core::{AckId, Clock, Delivery, Downstream, PartitionKey, PartitionStatus, SignalEnvelope};
use keel_storage::{AckRecord, AckStore, Reservation};

use crate::error::{LedgerError, LedgerResult};
use crate::partition::PartitionManager;

/// Number of lock stripes for per-signal serialization
const LOCK_STRIPES: usize = 64;

/// Outcome of an ingest call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    /// First successful ingest of this signal id
    Accepted,
    /// The signal id was already in the ledger; nothing was appended
    Duplicate,
}

/// Receipt returned to ingest callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub status: IngestStatus,
    pub ack_id: AckId,
    pub partition: PartitionKey,
    pub sequence: u64,
}

impl IngestReceipt {
    pub fn is_duplicate(&self) -> bool {
        self.status == IngestStatus::Duplicate
    }
}

/// Entry point for new signal envelopes
pub struct IngestGateway {
    partitions: Arc<PartitionManager>,
    acks: AckStore,
    downstream: Option<Arc<dyn Downstream>>,
    clock: Arc<dyn Clock>,
    stripes: Vec<Mutex<()>>,
}

impl std::fmt::Debug for IngestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestGateway")
            .field("propagates", &self.downstream.is_some())
            .finish_non_exhaustive()
    }
}

impl IngestGateway {
    /// Create a gateway; pass a downstream to propagate after each ingest
    pub fn new(
        partitions: Arc<PartitionManager>,
        acks: AckStore,
        downstream: Option<Arc<dyn Downstream>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            partitions,
            acks,
            downstream,
            clock,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, envelope: &SignalEnvelope) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        envelope.signal_id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    /// Ingest an envelope
    ///
    /// Returns `Accepted` the first time a signal id is ingested and
    /// `Duplicate` (with the same ack id) on every later call.
    #[instrument(skip_all, fields(signal_id = %envelope.signal_id))]
    pub async fn ingest(&self, envelope: SignalEnvelope) -> LedgerResult<IngestReceipt> {
        envelope.validate()?;
        let ack_id = envelope.ack_id();

        let _guard = self.stripe(&envelope).lock().await;

        if let Some(existing) = self.acks.get(&envelope.signal_id)? {
            if existing.is_committed() {
                return Ok(duplicate(existing));
            }
        }

        let target = self.target_partition(&envelope).await?;
        let reservation = AckRecord::reserved(
            envelope.signal_id.clone(),
            ack_id.clone(),
            target,
            self.clock.now_utc(),
        );

        let (partition, sequence) = match self.acks.reserve(reservation)? {
            Reservation::Fresh(_) => self.admit(target, &envelope).await?,
            Reservation::Existing(existing) if existing.is_committed() => {
                return Ok(duplicate(existing));
            }
            Reservation::Existing(existing) => self.resume(existing, target, &envelope).await?,
        };

        self.acks
            .commit(&envelope.signal_id, partition, sequence, self.clock.now_utc())?;
        info!(partition = %partition, sequence, ack_id = %ack_id, "Accepted signal");

        if let Some(downstream) = &self.downstream {
            let delivery = Delivery {
                partition,
                sequence,
                ack_id: ack_id.clone(),
                envelope,
            };
            if let Err(e) = downstream.deliver(&delivery).await {
                warn!(error = %e, "Propagation failed; left for reconciliation");
            }
        }

        Ok(IngestReceipt {
            status: IngestStatus::Accepted,
            ack_id,
            partition,
            sequence,
        })
    }

    /// Finish an ingest that reserved its ack but never committed it
    async fn resume(
        &self,
        reserved: AckRecord,
        target: PartitionKey,
        envelope: &SignalEnvelope,
    ) -> LedgerResult<(PartitionKey, u64)> {
        let candidates = [reserved.partition, target];
        for partition in candidates {
            if let Ok(Some(sequence)) = self
                .partitions
                .admitted_sequence(&partition, &envelope.signal_id)
                .await
            {
                debug!(partition = %partition, sequence, "Reserved ack already admitted");
                return Ok((partition, sequence));
            }
        }
        debug!("Reserved ack was never admitted");
        self.admit(target, envelope).await
    }

    /// Admit to the routed partition, following on to LATE when MAIN was
    /// sealed between routing and admission
    async fn admit(
        &self,
        partition: PartitionKey,
        envelope: &SignalEnvelope,
    ) -> LedgerResult<(PartitionKey, u64)> {
        match self.admit_once(partition, envelope).await {
            Err(LedgerError::PartitionSealed(sealed)) if sealed.is_main() => {
                let late = sealed.late_sibling();
                self.partitions.open_partition(late).await?;
                debug!(partition = %late, "MAIN sealed before admission; routing to LATE");
                Ok((late, self.admit_once(late, envelope).await?))
            }
            result => result.map(|sequence| (partition, sequence)),
        }
    }

    async fn admit_once(&self, partition: PartitionKey, envelope: &SignalEnvelope) -> LedgerResult<u64> {
        match self.partitions.admit(&partition, envelope).await {
            Ok(sequence) => Ok(sequence),
            Err(LedgerError::AlreadyAdmitted { sequence, .. }) => Ok(sequence),
            Err(e) => Err(e),
        }
    }

    /// MAIN partition for the envelope's date, or its LATE sibling once sealed
    async fn target_partition(&self, envelope: &SignalEnvelope) -> LedgerResult<PartitionKey> {
        let main = PartitionKey::main(envelope.partition_date());
        let summary = self.partitions.open_partition(main).await?;
        if summary.status == PartitionStatus::Open {
            return Ok(main);
        }

        let late = main.late_sibling();
        self.partitions.open_partition(late).await?;
        debug!(partition = %late, "MAIN sealed; routing to LATE");
        Ok(late)
    }
}

fn duplicate(record: AckRecord) -> IngestReceipt {
    debug!(signal_id = %record.signal_id, "Duplicate ingest");
    IngestReceipt {
        status: IngestStatus::Duplicate,
        ack_id: record.ack_id,
        partition: record.partition,
        sequence: record.sequence.unwrap_or_default(),
    }
}
