//! Error types for the replica engine.

use thiserror::Error;

/// All possible errors from the replica engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Contract violations
    #[error("unsupported value type: {0}")]
    UnsupportedValue(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("write while applying remote changes")]
    ReentrantWrite,

    #[error("node {node} is not a {expected}")]
    WrongKind { node: String, expected: &'static str },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node arena is full")]
    ArenaFull,

    #[error("index {index} out of range for list of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    // Lifecycle errors
    #[error("replica not connected: {0}")]
    NotConnected(String),

    #[error("replica disconnected: {0}")]
    Disconnected(String),

    #[error("migration to version {version} failed: {reason}")]
    Migration { version: u64, reason: String },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownModel("Cart".into());
        assert_eq!(err.to_string(), "unknown model: Cart");

        let err = Error::Migration {
            version: 2,
            reason: "boom".into(),
        };
        assert_eq!(err.to_string(), "migration to version 2 failed: boom");

        let err = Error::IndexOutOfRange { index: 4, len: 2 };
        assert_eq!(
            err.to_string(),
            "index 4 out of range for list of length 2"
        );
    }
}
