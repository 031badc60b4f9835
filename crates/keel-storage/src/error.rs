//! Error types for keel-storage
//!
//! Codec-level faults (corrupt frames, crash tails) are not errors: they are
//! reported as data in a [`DecodeReport`](crate::frame::DecodeReport). The
//! variants here cover I/O, catalog, and lifecycle failures.

use thiserror::Error;

/// Errors that can occur in storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error during storage operations
    #[error("I/O error: {0}")]
    Io(String),

    /// Requested item was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Append attempted on a sealed segment
    #[error("Segment is sealed: {0}")]
    SegmentSealed(String),

    /// Segment creation collided with an existing segment
    #[error("Segment already exists: {0}")]
    SegmentExists(String),

    /// Payload does not fit in a frame
    #[error("Frame payload too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Catalog database error
    #[error("Database error: {0}")]
    Database(String),
}

impl StorageError {
    /// Create a new NotFound error
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Postcard failures on the read path; encode sites map to
/// [`StorageError::Serialization`] explicitly
impl From<postcard::Error> for StorageError {
    fn from(err: postcard::Error) -> Self {
        StorageError::Deserialization(err.to_string())
    }
}

/// Every redb error type surfaces as [`StorageError::Database`]
macro_rules! database_errors {
    ($($err:ty),+ $(,)?) => {
        $(
            impl From<$err> for StorageError {
                fn from(err: $err) -> Self {
                    StorageError::Database(err.to_string())
                }
            }
        )+
    };
}

database_errors!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
