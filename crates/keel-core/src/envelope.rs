//! Signal envelopes and their identifiers
//!
//! A [`SignalEnvelope`] is created once per distinct upstream event and never
//! mutated afterwards. Its [`SignalId`] is the idempotency key for ingestion;
//! the matching [`AckId`] is a pure function of that id, so every retry of the
//! same logical event observes the same acknowledgment.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// Domain separator for acknowledgment id derivation
const ACK_DOMAIN: &[u8] = b"keel.ack.v1";

/// Number of digest bytes carried in an ack id
const ACK_ID_BYTES: usize = 16;

/// Unique, immutable identifier of a signal envelope
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(String);

impl SignalId {
    /// Create a signal id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (never valid for ingestion)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SignalId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SignalId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Deterministic acknowledgment identifier returned to ingest callers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckId(String);

impl AckId {
    /// Derive the ack id for a signal id
    ///
    /// The derivation depends only on the signal id: no clock, no randomness.
    pub fn derive(signal_id: &SignalId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ACK_DOMAIN);
        hasher.update(signal_id.as_str().as_bytes());
        let digest = hasher.finalize();
        Self(format!("ack_{}", hex::encode(&digest.as_bytes()[..ACK_ID_BYTES])))
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the deterministic ack id for a signal id
pub fn deterministic_ack_id(signal_id: &SignalId) -> AckId {
    AckId::derive(signal_id)
}

/// The single record type admitted to the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Unique, immutable signal identifier
    pub signal_id: SignalId,
    /// Identifier of the upstream event this signal was derived from
    pub source_event_id: String,
    /// Signal category
    pub category: String,
    /// Probability in `[0, 1]`
    pub probability: f64,
    /// Confidence score in `[0, 1]`
    pub confidence_score: f64,
    /// Trace identifier for cross-system correlation
    pub trace_id: String,
    /// When the signal was generated upstream
    pub generated_at: DateTime<Utc>,
    /// Opaque payload body
    #[serde(default)]
    pub body: Bytes,
}

impl SignalEnvelope {
    /// Create an envelope with empty descriptive fields
    pub fn new(signal_id: impl Into<SignalId>, generated_at: DateTime<Utc>) -> Self {
        Self {
            signal_id: signal_id.into(),
            source_event_id: String::new(),
            category: String::new(),
            probability: 0.0,
            confidence_score: 0.0,
            trace_id: String::new(),
            generated_at,
            body: Bytes::new(),
        }
    }

    /// Set the upstream event id
    pub fn with_source_event(mut self, source_event_id: impl Into<String>) -> Self {
        self.source_event_id = source_event_id.into();
        self
    }

    /// Set the category
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Set probability and confidence
    pub fn with_scores(mut self, probability: f64, confidence_score: f64) -> Self {
        self.probability = probability;
        self.confidence_score = confidence_score;
        self
    }

    /// Set the trace id
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Set the opaque body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// The UTC calendar date that keys this envelope's partition
    pub fn partition_date(&self) -> NaiveDate {
        self.generated_at.date_naive()
    }

    /// The ack id this envelope will be acknowledged with
    pub fn ack_id(&self) -> AckId {
        AckId::derive(&self.signal_id)
    }

    /// Validate the envelope before it touches the ledger
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.signal_id.is_empty() {
            return Err(EnvelopeError::EmptySignalId);
        }
        check_unit("probability", self.probability)?;
        check_unit("confidence_score", self.confidence_score)?;
        Ok(())
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<(), EnvelopeError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(EnvelopeError::OutOfRange { field, value })
    }
}
