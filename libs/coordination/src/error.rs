//! Error types for coordination service operations.
//!
//! Session-backed operations fail with one of a small set of kinds. Only
//! [`CoordinationError::SessionExpired`] is ever retried by
//! [`SessionClient`](crate::SessionClient); everything else reaches the
//! caller on first occurrence.

use thiserror::Error;

/// Top-level error type for the coordination crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// The service invalidated the session. A new session must be built
    /// before further operations can succeed.
    #[error("coordination session expired")]
    SessionExpired,

    /// A freshly built session could not be established or failed its
    /// connectivity check.
    #[error("connection error: {0}")]
    Connection(String),

    /// The session exists but is not currently connected to any server.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The path does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// A node already exists at the path.
    #[error("node exists: {0}")]
    NodeExists(String),

    /// The request was malformed (bad path, unsupported mode, ...).
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// Any other protocol-level failure reported by the service.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Codec error during serialization or deserialization of node data.
    #[error("codec error: {0}")]
    Codec(String),
}

impl CoordinationError {
    /// Returns true if this error is remedied by rebuilding the session and
    /// retrying. Only an expired session qualifies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinationError::SessionExpired)
    }

    /// Returns true if the path was missing.
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordinationError::NoNode(_))
    }

    /// Returns true if the path already existed.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordinationError::NodeExists(_))
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CoordinationError::SessionExpired.is_retryable());

        let non_retryable = [
            CoordinationError::Connection("refused".into()),
            CoordinationError::NotConnected("no conn".into()),
            CoordinationError::NoNode("/a".into()),
            CoordinationError::NodeExists("/a".into()),
            CoordinationError::BadArguments("empty path".into()),
            CoordinationError::Protocol("marshalling".into()),
            CoordinationError::Codec("bad json".into()),
        ];
        for err in non_retryable {
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }

        assert!(CoordinationError::NoNode("/a".into()).is_no_node());
        assert!(CoordinationError::NodeExists("/a".into()).is_node_exists());
        assert!(!CoordinationError::SessionExpired.is_no_node());
    }

    #[test]
    fn test_error_display() {
        let err = CoordinationError::Connection("not in connected state".into());
        let msg = format!("{err}");
        assert!(msg.contains("connection error"));
        assert!(msg.contains("not in connected state"));
    }
}
