//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or applying wire payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload was not valid JSON or did not match the expected shape.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A feed frame was well-formed JSON but not a recognised message.
    #[error("invalid feed message: {message}")]
    InvalidMessage {
        /// Description of the structural problem.
        message: String,
    },

    /// A collection name that this client does not know.
    #[error("unknown collection: {name}")]
    UnknownCollection {
        /// Name as received.
        name: String,
    },

    /// An update did not carry an integer `version`.
    #[error("update for {id} is missing its version")]
    MissingVersion {
        /// Target entity id.
        id: String,
    },
}

impl ProtocolError {
    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create an invalid message error.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::decoding_failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_become_decoding_failures() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::DecodingFailed { .. }));
    }

    #[test]
    fn error_display() {
        let err = ProtocolError::MissingVersion { id: "s1".into() };
        assert_eq!(err.to_string(), "update for s1 is missing its version");
    }
}
