//! Error types for the HTTP surface

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use keel_core::KeyError;
use keel_ledger::LedgerError;

/// Errors returned by request handlers and server startup
#[derive(Debug, Error)]
pub enum ServerError {
    /// A ledger operation failed
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A path or query parameter did not parse
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<KeyError> for ServerError {
    fn from(err: KeyError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl ServerError {
    /// Returns the HTTP status code for this error.
    ///
    /// - Invalid envelope or key: 400 Bad Request
    /// - Unknown partition, segment or frame: 404 Not Found
    /// - Sealed partition or forbidden transition: 409 Conflict
    /// - Downstream failure outside a reconcile run: 502 Bad Gateway
    /// - Anything else: 500 Internal Server Error
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Ledger(err) => match err {
                LedgerError::InvalidEnvelope(_) | LedgerError::InvalidKey(_) => {
                    StatusCode::BAD_REQUEST
                }
                LedgerError::PartitionNotFound(_)
                | LedgerError::SegmentNotFound(_)
                | LedgerError::FrameNotFound { .. } => StatusCode::NOT_FOUND,
                LedgerError::PartitionSealed(_)
                | LedgerError::InvalidTransition { .. }
                | LedgerError::AlreadyAdmitted { .. } => StatusCode::CONFLICT,
                LedgerError::Downstream(_) => StatusCode::BAD_GATEWAY,
                LedgerError::Storage(_) | LedgerError::Config(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Result type alias for handlers
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use keel_core::{EnvelopeError, PartitionKey};

    fn key() -> PartitionKey {
        PartitionKey::main(NaiveDate::from_ymd_opt(2026, 1, 28).unwrap())
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ServerError::from(LedgerError::InvalidEnvelope(EnvelopeError::EmptySignalId)),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServerError::from(LedgerError::PartitionNotFound(key())),
                StatusCode::NOT_FOUND,
            ),
            (
                ServerError::from(LedgerError::PartitionSealed(key())),
                StatusCode::CONFLICT,
            ),
            (
                ServerError::from(LedgerError::Config("bad".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ServerError::from(KeyError::UnknownType("weekly".into())),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{err}");
        }
    }
}
