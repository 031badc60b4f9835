//! Error types shared across Keel crates

use thiserror::Error;

/// Errors raised when an envelope fails validation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvelopeError {
    #[error("Signal id must not be empty")]
    EmptySignalId,

    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Errors raised when parsing partition keys and enum values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Invalid partition date: {0}")]
    InvalidDate(String),

    #[error("Unknown partition type: {0}")]
    UnknownType(String),

    #[error("Invalid partition key: {0}")]
    InvalidKey(String),
}

/// Errors reported by the downstream processing system
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownstreamError {
    /// The downstream could not be contacted at all
    #[error("Downstream unreachable: {0}")]
    Unreachable(String),

    /// The downstream refused a specific delivery
    #[error("Delivery of {signal_id} rejected: {reason}")]
    Rejected { signal_id: String, reason: String },

    /// A call did not complete within its deadline
    #[error("Downstream call timed out after {millis}ms")]
    Timeout { millis: u64 },
}

impl DownstreamError {
    /// Whether this error means the downstream as a whole is unavailable
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_error_display() {
        let err = EnvelopeError::OutOfRange {
            field: "probability",
            value: 1.5,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("probability"));
        assert!(msg.contains("1.5"));

        assert!(format!("{}", EnvelopeError::EmptySignalId).contains("empty"));
    }

    #[test]
    fn test_key_error_display() {
        let err = KeyError::UnknownType("weekly".to_string());
        assert!(format!("{}", err).contains("weekly"));
    }

    #[test]
    fn test_downstream_error_display() {
        let err = DownstreamError::Rejected {
            signal_id: "sig-1".to_string(),
            reason: "schema".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("sig-1"));
        assert!(msg.contains("schema"));

        assert!(format!("{}", DownstreamError::Timeout { millis: 250 }).contains("250"));
    }

    #[test]
    fn test_unreachable_classification() {
        assert!(DownstreamError::Unreachable("down".into()).is_unreachable());
        assert!(!DownstreamError::Timeout { millis: 1 }.is_unreachable());
    }
}
