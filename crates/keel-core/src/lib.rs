//! # Keel Core
//!
//! Core traits, types, and errors for the Keel signal ledger.
//!
//! This crate provides the foundational abstractions shared by the storage
//! engine, the ledger services, and the HTTP surface. The same ingestion and
//! reconciliation logic runs against a real downstream processing store or
//! against the in-memory [`MockDownstream`] used by tests.
//!
//! ## Key Traits
//!
//! - [`Downstream`]: The consuming system that the ledger reconciles against
//! - [`Clock`]: Time abstraction for testability
//!
//! ## Key Types
//!
//! - [`SignalEnvelope`]: The single record type admitted to the ledger
//! - [`SignalId`] / [`AckId`]: Envelope identity and its deterministic acknowledgment
//! - [`PartitionKey`]: Date- and type-scoped partition address

pub mod envelope;
pub mod error;
pub mod mock_downstream;
pub mod partition;
pub mod traits;

// Re-export main types
pub use envelope::*;
pub use error::*;
pub use mock_downstream::*;
pub use partition::*;
pub use traits::*;
