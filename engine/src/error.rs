//! Error types for the patternsync engine.

use crate::{state::CrdtType, EntityId};
use thiserror::Error;

/// All possible errors from the patternsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("clock error: {0}")]
    Clock(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid CRDT type: expected {expected}, got {actual}")]
    InvalidType { expected: CrdtType, actual: CrdtType },

    #[error("invalid state: {0}")]
    InvalidState(String),

    // Store errors
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("entity already exists: {0}")]
    EntityAlreadyExists(EntityId),

    // Persistence errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Deserialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::EntityNotFound("p1".into());
        assert_eq!(err.to_string(), "entity not found: p1");

        let err = Error::InvalidType {
            expected: CrdtType::OrSet,
            actual: CrdtType::GCounter,
        };
        assert_eq!(
            err.to_string(),
            "invalid CRDT type: expected ORSet, got GCounter"
        );

        let err = Error::Clock("negative timestamp for replica 'r1': -3".into());
        assert_eq!(
            err.to_string(),
            "clock error: negative timestamp for replica 'r1': -3"
        );
    }

    #[test]
    fn json_errors_become_deserialization_errors() {
        let err: Error = serde_json::from_str::<u64>("not json").unwrap_err().into();
        assert!(matches!(err, Error::Deserialization(_)));
    }
}
