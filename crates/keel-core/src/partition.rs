//! Partition addressing
//!
//! Partitions are keyed by a UTC calendar date plus a [`PartitionType`].
//! MAIN partitions admit records for their date until sealed; LATE partitions
//! collect records that arrive after the MAIN partition for the same date
//! has sealed, and never seal themselves.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// Date format used in partition keys
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Kind of partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionType {
    /// Primary partition for a date; seals once its admission window closes
    Main,
    /// Late-arrival partition; stays open indefinitely
    Late,
}

impl PartitionType {
    /// Lowercase name used in paths and keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Late => "late",
        }
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" => Ok(Self::Main),
            "late" => Ok(Self::Late),
            other => Err(KeyError::UnknownType(other.to_string())),
        }
    }
}

/// Lifecycle state of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionStatus {
    Open,
    Sealed,
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("OPEN"),
            Self::Sealed => f.write_str("SEALED"),
        }
    }
}

impl FromStr for PartitionStatus {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(Self::Open),
            "SEALED" => Ok(Self::Sealed),
            other => Err(KeyError::InvalidKey(other.to_string())),
        }
    }
}

/// Address of a partition: `(date, type)`
///
/// Renders as `2026-01-28.main`, which is also the on-disk directory name
/// and the catalog key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub date: NaiveDate,
    pub kind: PartitionType,
}

impl PartitionKey {
    /// Create a key
    pub fn new(date: NaiveDate, kind: PartitionType) -> Self {
        Self { date, kind }
    }

    /// MAIN partition for a date
    pub fn main(date: NaiveDate) -> Self {
        Self::new(date, PartitionType::Main)
    }

    /// LATE partition for a date
    pub fn late(date: NaiveDate) -> Self {
        Self::new(date, PartitionType::Late)
    }

    /// Whether this is a MAIN partition
    pub fn is_main(&self) -> bool {
        self.kind == PartitionType::Main
    }

    /// The LATE partition that shares this key's date
    pub fn late_sibling(&self) -> Self {
        Self::late(self.date)
    }

    /// Parse a bare date (`2026-01-28`)
    pub fn parse_date(s: &str) -> Result<NaiveDate, KeyError> {
        NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| KeyError::InvalidDate(s.to_string()))
    }

    /// Catalog key bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.date.format(DATE_FORMAT), self.kind)
    }
}

impl FromStr for PartitionKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (date, kind) = s
            .split_once('.')
            .ok_or_else(|| KeyError::InvalidKey(s.to_string()))?;
        Ok(Self::new(Self::parse_date(date)?, kind.parse()?))
    }
}
