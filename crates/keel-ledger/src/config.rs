//! Configuration for the ledger

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keel_storage::{FileSegmentStoreConfig, RedbStorageConfig};

/// Segment sizing and durability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Rotate to a new segment once the open one reaches this size
    pub max_segment_bytes: u64,
    /// `sync_data` after every append
    pub sync_on_write: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 64 * 1024 * 1024, // 64MB
            sync_on_write: true,
        }
    }
}

/// Catalog database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Database file; relative paths resolve against the data directory
    pub db_path: PathBuf,
    /// Cache size in bytes
    pub cache_size: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("catalog.redb"),
            cache_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// Reconciliation policy and replay budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Deadline for one downstream call, in milliseconds
    pub replay_timeout_ms: u64,
    /// Delivery attempts per missing id
    pub max_attempts: u32,
    /// Pause between attempts, in milliseconds (doubles each retry)
    pub retry_backoff_ms: u64,
    /// Reconcile LATE partitions instead of skipping them
    pub reconcile_late: bool,
    /// Report MAIN partitions that are still open as `Partial`
    pub require_sealed_main: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            replay_timeout_ms: 5_000,
            max_attempts: 3,
            retry_backoff_ms: 100,
            reconcile_late: false,
            require_sealed_main: false,
        }
    }
}

impl ReconcileConfig {
    pub fn replay_timeout(&self) -> Duration {
        Duration::from_millis(self.replay_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Background sealing and reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Run the maintenance task at all
    pub enabled: bool,
    /// Seconds between maintenance passes
    pub interval_secs: u64,
    /// Seconds after a day ends before its MAIN partition is sealed
    pub seal_grace_secs: u64,
    /// Reconcile each partition right after sealing it
    pub reconcile_after_seal: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 300,
            seal_grace_secs: 3_600,
            reconcile_after_seal: true,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Grace after midnight before a day is sealed; saturates rather than
    /// overflowing for values past what chrono can represent
    pub fn seal_grace(&self) -> chrono::Duration {
        i64::try_from(self.seal_grace_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Configuration for a [`Ledger`](crate::Ledger)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Base directory for all ledger data
    pub data_dir: PathBuf,
    pub segments: SegmentConfig,
    pub catalog: CatalogConfig,
    pub reconcile: ReconcileConfig,
    pub maintenance: MaintenanceConfig,
    /// Deliver to the downstream right after a successful ingest
    pub propagate_on_ingest: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./keel-data"),
            segments: SegmentConfig::default(),
            catalog: CatalogConfig::default(),
            reconcile: ReconcileConfig::default(),
            maintenance: MaintenanceConfig::default(),
            propagate_on_ingest: true,
        }
    }
}

impl LedgerConfig {
    /// Create a configuration with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the segment configuration
    pub fn with_segments(mut self, segments: SegmentConfig) -> Self {
        self.segments = segments;
        self
    }

    /// Set the maximum segment size
    pub fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.segments.max_segment_bytes = bytes;
        self
    }

    /// Set the reconciliation configuration
    pub fn with_reconcile(mut self, reconcile: ReconcileConfig) -> Self {
        self.reconcile = reconcile;
        self
    }

    /// Enable or disable delivery on ingest
    pub fn with_propagation(mut self, enabled: bool) -> Self {
        self.propagate_on_ingest = enabled;
        self
    }

    /// Directory holding segment files
    pub fn segments_dir(&self) -> PathBuf {
        self.data_dir.join("segments")
    }

    /// Resolved catalog database path
    pub fn catalog_path(&self) -> PathBuf {
        resolve(&self.data_dir, &self.catalog.db_path)
    }

    /// Segment store settings derived from this config
    pub fn segment_store(&self) -> FileSegmentStoreConfig {
        FileSegmentStoreConfig {
            base_dir: self.segments_dir(),
            sync_on_write: self.segments.sync_on_write,
        }
    }

    /// Catalog settings derived from this config
    pub fn catalog_store(&self) -> RedbStorageConfig {
        RedbStorageConfig {
            db_path: self.catalog_path(),
            cache_size: self.catalog.cache_size,
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = LedgerConfig::with_data_dir("/var/lib/keel");
        assert_eq!(config.segments_dir(), PathBuf::from("/var/lib/keel/segments"));
        assert_eq!(
            config.catalog_path(),
            PathBuf::from("/var/lib/keel/catalog.redb")
        );

        let mut absolute = config.clone();
        absolute.catalog.db_path = PathBuf::from("/tmp/other.redb");
        assert_eq!(absolute.catalog_path(), PathBuf::from("/tmp/other.redb"));
    }

    #[test]
    fn test_backoff_doubles() {
        let reconcile = ReconcileConfig {
            retry_backoff_ms: 10,
            ..Default::default()
        };
        assert_eq!(reconcile.backoff(1), Duration::from_millis(10));
        assert_eq!(reconcile.backoff(2), Duration::from_millis(20));
        assert_eq!(reconcile.backoff(3), Duration::from_millis(40));
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: LedgerConfig = serde_json::from_str(
            r#"{"data_dir": "/data", "reconcile": {"reconcile_late": true}}"#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert!(config.reconcile.reconcile_late);
        assert_eq!(config.reconcile.max_attempts, 3);
        assert!(config.propagate_on_ingest);
    }

    #[test]
    fn test_builders() {
        let config = LedgerConfig::default()
            .with_max_segment_bytes(1024)
            .with_propagation(false);
        assert_eq!(config.segments.max_segment_bytes, 1024);
        assert!(!config.propagate_on_ingest);
    }

    #[test]
    fn test_maintenance_durations() {
        let maintenance = MaintenanceConfig {
            interval_secs: 0,
            seal_grace_secs: 90,
            ..Default::default()
        };
        assert!(!MaintenanceConfig::default().enabled);
        assert_eq!(maintenance.interval(), Duration::from_secs(1));
        assert_eq!(maintenance.seal_grace(), chrono::Duration::seconds(90));
    }

    #[test]
    fn test_huge_seal_grace_saturates() {
        let config: LedgerConfig = serde_json::from_str(&format!(
            r#"{{"maintenance": {{"seal_grace_secs": {}}}}}"#,
            i64::MAX
        ))
        .unwrap();
        assert_eq!(config.maintenance.seal_grace(), chrono::Duration::MAX);

        let maintenance = MaintenanceConfig {
            seal_grace_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(maintenance.seal_grace(), chrono::Duration::MAX);
    }
}
