//! Error types for the sync engine.

use suitesync_protocol::{ApiErrorKind, Collection, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Stale versions are not errors: they are dropped silently by the
/// reconciler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The REST API answered with an error body.
    #[error("{context}: {kind}")]
    Api {
        /// Error kind from the body.
        kind: ApiErrorKind,
        /// What was being fetched.
        context: String,
    },

    /// An update names an entity that cannot be located.
    #[error("missing entity {id} in {collection}")]
    MissingEntity {
        /// Collection.
        collection: Collection,
        /// Entity id.
        id: String,
    },

    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),

    /// The caller is no longer interested in the result.
    #[error("cancelled")]
    Cancelled,

    /// Not connected.
    #[error("not connected to change feed")]
    NotConnected,

    /// The engine is no longer running.
    #[error("sync engine stopped")]
    Stopped,

    /// The configured base URL cannot carry request paths.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an API error.
    pub fn api(kind: ApiErrorKind, context: impl Into<String>) -> Self {
        Self::Api {
            kind,
            context: context.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            SyncError::Api { kind, .. } => *kind == ApiErrorKind::Unknown,
            _ => false,
        }
    }

    /// Returns true if a response arrived but could not be decoded.
    ///
    /// Asking again yields the same payload, so these are never retried.
    pub fn is_decode(&self) -> bool {
        matches!(self, SyncError::Decode(_))
    }

    /// Returns true for a `not_found` API error.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SyncError::Api {
                kind: ApiErrorKind::NotFound,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::NotConnected.is_retryable());
        assert!(SyncError::api(ApiErrorKind::Unknown, "fetch suite").is_retryable());
        assert!(!SyncError::api(ApiErrorKind::BadRequest, "fetch suite").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn not_found_detection() {
        assert!(SyncError::api(ApiErrorKind::NotFound, "fetch suite s1").is_not_found());
        assert!(!SyncError::Cancelled.is_not_found());
    }

    #[test]
    fn decode_detection() {
        let err = SyncError::from(ProtocolError::decoding_failed("expected value"));
        assert!(err.is_decode());
        assert!(!err.is_retryable());
        assert!(!SyncError::transport_retryable("reset").is_decode());
    }

    #[test]
    fn error_display() {
        let err = SyncError::api(ApiErrorKind::NotFound, "fetch suites/s1");
        assert_eq!(err.to_string(), "fetch suites/s1: not_found");

        let err = SyncError::MissingEntity {
            collection: Collection::Cases,
            id: "c9".into(),
        };
        assert_eq!(err.to_string(), "missing entity c9 in cases");
    }
}
