//! redb table definitions and catalog storage manager
//!
//! Defines all tables used by the ledger catalog.

use std::path::PathBuf;
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::StorageError;

/// Key/value pairs returned by prefix scans
pub type ScanResults = Vec<(Vec<u8>, Vec<u8>)>;

/// A table of raw byte keys and values
pub type Table = TableDefinition<'static, &'static [u8], &'static [u8]>;

// Table definitions
// Key: partition key string, Value: serialized PartitionRecord
pub const PARTITIONS: Table = TableDefinition::new("partitions");

// Key: partition key string, Value: serialized Manifest
pub const MANIFESTS: Table = TableDefinition::new("manifests");

// Key: signal id bytes, Value: serialized AckRecord
pub const ACK_RECORDS: Table = TableDefinition::new("ack_records");

// Key: (partition key, '/', started_at micros BE, run id) concatenated,
// Value: serialized ReconcileResult
pub const RECONCILE_RUNS: Table = TableDefinition::new("reconcile_runs");

// Key: (partition key, '/', signal id) concatenated, Value: empty
pub const PROCESSED: Table = TableDefinition::new("processed");

const ALL_TABLES: [Table; 5] = [PARTITIONS, MANIFESTS, ACK_RECORDS, RECONCILE_RUNS, PROCESSED];

/// Configuration for the catalog database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedbStorageConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Cache size in bytes
    pub cache_size: usize,
}

impl Default for RedbStorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/catalog.redb"),
            cache_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// One write in a multi-table transaction
#[derive(Clone)]
pub struct BatchWrite {
    pub table: Table,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BatchWrite {
    pub fn new(table: Table, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            table,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Catalog storage manager
pub struct RedbStorage {
    db: Arc<Database>,
    config: RedbStorageConfig,
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedbStorage {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbStorageConfig) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::builder()
            .set_cache_size(config.cache_size)
            .create(&config.db_path)?;

        info!("Opened catalog database");

        let storage = Self {
            db: Arc::new(db),
            config,
        };
        storage.init_tables()?;
        Ok(storage)
    }

    /// Create a catalog that lives only in memory
    pub fn in_memory() -> Result<Self, StorageError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        let storage = Self {
            db: Arc::new(db),
            config: RedbStorageConfig {
                db_path: PathBuf::from(":memory:"),
                ..Default::default()
            },
        };
        storage.init_tables()?;
        Ok(storage)
    }

    /// Initialize all tables
    fn init_tables(&self) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        for table in ALL_TABLES {
            write_txn.open_table(table)?;
        }
        write_txn.commit()?;

        debug!("Initialized catalog tables");
        Ok(())
    }

    /// Get the configuration
    pub fn config(&self) -> &RedbStorageConfig {
        &self.config
    }

    /// Put a key-value pair in a table
    pub fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Apply several writes, possibly across tables, in one transaction
    pub fn put_many(&self, writes: &[BatchWrite]) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        for write in writes {
            let mut table = write_txn.open_table(write.table)?;
            table.insert(write.key.as_slice(), write.value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Insert a value unless the key is present
    ///
    /// Returns the existing value when there was one; the check and the
    /// insert happen in a single write transaction.
    pub fn insert_if_absent(
        &self,
        table: Table,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let write_txn = self.db.begin_write()?;
        let existing = {
            let mut table = write_txn.open_table(table)?;
            let existing = table.get(key)?.map(|v| v.value().to_vec());
            if existing.is_none() {
                table.insert(key, value)?;
            }
            existing
        };
        write_txn.commit()?;
        Ok(existing)
    }

    /// Get a value from a table
    pub fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    /// Iterate over all entries in a table with a prefix
    pub fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<ScanResults, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;

        let mut results = Vec::new();

        // Keys are ordered, so the prefix run starts at `prefix`
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key_bytes = key.value();

            // First key outside the run ends it
            if !key_bytes.starts_with(prefix) {
                break;
            }

            results.push((key_bytes.to_vec(), value.value().to_vec()));
        }

        Ok(results)
    }

    /// Count entries with a prefix
    pub fn count_prefix(&self, table: Table, prefix: &[u8]) -> Result<usize, StorageError> {
        self.scan_prefix(table, prefix).map(|v| v.len())
    }

    /// Number of entries in a table
    pub fn table_len(&self, table: Table) -> Result<u64, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        Ok(table.len()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (RedbStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = RedbStorageConfig {
            db_path: temp_dir.path().join("test.redb"),
            ..Default::default()
        };
        let storage = RedbStorage::open(config).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_put_get() {
        let (storage, _temp) = create_test_storage();

        storage.put(PARTITIONS, b"2026-01-28.main", b"record").unwrap();

        let retrieved = storage.get(PARTITIONS, b"2026-01-28.main").unwrap();
        assert_eq!(retrieved, Some(b"record".to_vec()));
        assert!(storage.get(MANIFESTS, b"2026-01-28.main").unwrap().is_none());
    }

    #[test]
    fn test_scan_prefix() {
        let storage = RedbStorage::in_memory().unwrap();

        storage.put(PROCESSED, b"2026-01-28.main/a", b"").unwrap();
        storage.put(PROCESSED, b"2026-01-28.main/b", b"").unwrap();
        storage.put(PROCESSED, b"2026-01-28.late/a", b"").unwrap();
        storage.put(PROCESSED, b"2026-01-29.main/a", b"").unwrap();

        let main = storage.scan_prefix(PROCESSED, b"2026-01-28.main/").unwrap();
        assert_eq!(main.len(), 2);
        assert_eq!(storage.count_prefix(PROCESSED, b"2026-01-28.").unwrap(), 3);
        assert_eq!(storage.table_len(PROCESSED).unwrap(), 4);
    }

    #[test]
    fn test_insert_if_absent() {
        let storage = RedbStorage::in_memory().unwrap();

        assert_eq!(storage.insert_if_absent(ACK_RECORDS, b"k", b"v1").unwrap(), None);
        assert_eq!(
            storage.insert_if_absent(ACK_RECORDS, b"k", b"v2").unwrap(),
            Some(b"v1".to_vec())
        );
        assert_eq!(storage.get(ACK_RECORDS, b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_put_many_spans_tables() {
        let storage = RedbStorage::in_memory().unwrap();

        storage
            .put_many(&[
                BatchWrite::new(PARTITIONS, b"p".to_vec(), b"record".to_vec()),
                BatchWrite::new(MANIFESTS, b"p".to_vec(), b"manifest".to_vec()),
            ])
            .unwrap();

        assert!(storage.get(PARTITIONS, b"p").unwrap().is_some());
        assert!(storage.get(MANIFESTS, b"p").unwrap().is_some());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let config = RedbStorageConfig {
            db_path: temp_dir.path().join("catalog.redb"),
            ..Default::default()
        };

        {
            let storage = RedbStorage::open(config.clone()).unwrap();
            storage.put(PARTITIONS, b"k", b"v").unwrap();
        }

        let storage = RedbStorage::open(config).unwrap();
        assert_eq!(storage.get(PARTITIONS, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
