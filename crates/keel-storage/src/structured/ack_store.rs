//! Acknowledgment records
//!
//! One record per signal id. A record is written as `Reserved` before the
//! envelope is appended to the ledger and flipped to `Committed` once the
//! append is durable; committed records never change again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_core::{AckId, PartitionKey, SignalId};

use super::tables::{ACK_RECORDS, RedbStorage};
use crate::error::StorageError;

/// Lifecycle of an acknowledgment record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckState {
    /// Written before the ledger append; the append may not have happened
    Reserved,
    /// The envelope is in the ledger
    Committed,
}

/// Mapping from a signal id to its acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRecord {
    pub signal_id: SignalId,
    pub ack_id: AckId,
    /// Partition the envelope was (or is being) admitted to
    pub partition: PartitionKey,
    pub state: AckState,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    /// Ledger sequence, set on commit
    pub sequence: Option<u64>,
}

impl AckRecord {
    /// Create a reservation
    pub fn reserved(
        signal_id: SignalId,
        ack_id: AckId,
        partition: PartitionKey,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            signal_id,
            ack_id,
            partition,
            state: AckState::Reserved,
            created_at,
            committed_at: None,
            sequence: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == AckState::Committed
    }
}

/// Outcome of [`AckStore::reserve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// No record existed; the given one was stored
    Fresh(AckRecord),
    /// A record already existed and was left untouched
    Existing(AckRecord),
}

/// Acknowledgment record storage
#[derive(Debug)]
pub struct AckStore {
    storage: Arc<RedbStorage>,
}

impl AckStore {
    pub fn new(storage: Arc<RedbStorage>) -> Self {
        Self { storage }
    }

    /// Store a reservation unless a record for the id exists
    pub fn reserve(&self, record: AckRecord) -> Result<Reservation, StorageError> {
        let value = postcard::to_allocvec(&record)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        match self
            .storage
            .insert_if_absent(ACK_RECORDS, record.signal_id.as_str().as_bytes(), &value)?
        {
            Some(existing) => Ok(Reservation::Existing(postcard::from_bytes(&existing)?)),
            None => {
                debug!(signal_id = %record.signal_id, "Reserved ack");
                Ok(Reservation::Fresh(record))
            }
        }
    }

    /// Mark a record committed at its final ledger position
    ///
    /// Committing an already-committed record returns it unchanged.
    pub fn commit(
        &self,
        signal_id: &SignalId,
        partition: PartitionKey,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<AckRecord, StorageError> {
        let mut record = self
            .get(signal_id)?
            .ok_or_else(|| StorageError::not_found(format!("ack record for {signal_id}")))?;
        if record.is_committed() {
            return Ok(record);
        }

        record.state = AckState::Committed;
        record.partition = partition;
        record.sequence = Some(sequence);
        record.committed_at = Some(at);

        let value = postcard::to_allocvec(&record)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        self.storage
            .put(ACK_RECORDS, signal_id.as_str().as_bytes(), &value)?;

        debug!(signal_id = %signal_id, sequence, "Committed ack");
        Ok(record)
    }

    /// Look up a record
    pub fn get(&self, signal_id: &SignalId) -> Result<Option<AckRecord>, StorageError> {
        match self.storage.get(ACK_RECORDS, signal_id.as_str().as_bytes())? {
            Some(value) => Ok(Some(postcard::from_bytes(&value)?)),
            None => Ok(None),
        }
    }

    /// Number of records
    pub fn count(&self) -> Result<u64, StorageError> {
        self.storage.table_len(ACK_RECORDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn partition() -> PartitionKey {
        PartitionKey::main(NaiveDate::from_ymd_opt(2026, 1, 28).unwrap())
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 28, 12, 0, 0).unwrap()
    }

    fn reservation(id: &str) -> AckRecord {
        let signal_id = SignalId::new(id);
        let ack_id = AckId::derive(&signal_id);
        AckRecord::reserved(signal_id, ack_id, partition(), at())
    }

    fn create_store() -> AckStore {
        AckStore::new(Arc::new(RedbStorage::in_memory().unwrap()))
    }

    #[test]
    fn test_reserve_then_existing() {
        let store = create_store();

        let first = store.reserve(reservation("sig-1")).unwrap();
        assert!(matches!(first, Reservation::Fresh(_)));

        let second = store.reserve(reservation("sig-1")).unwrap();
        match second {
            Reservation::Existing(record) => assert_eq!(record.state, AckState::Reserved),
            other => panic!("expected existing reservation, got {other:?}"),
        }
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_commit_is_final() {
        let store = create_store();
        let id = SignalId::new("sig-2");
        store.reserve(reservation("sig-2")).unwrap();

        let committed = store.commit(&id, partition(), 7, at()).unwrap();
        assert!(committed.is_committed());
        assert_eq!(committed.sequence, Some(7));

        // A second commit does not move the record
        let again = store
            .commit(&id, partition().late_sibling(), 99, at())
            .unwrap();
        assert_eq!(again, committed);
        assert_eq!(store.get(&id).unwrap(), Some(committed));
    }

    #[test]
    fn test_commit_without_reservation() {
        let store = create_store();
        assert!(matches!(
            store.commit(&SignalId::new("ghost"), partition(), 1, at()),
            Err(StorageError::NotFound(_))
        ));
    }
}
