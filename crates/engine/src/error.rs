//! Error types for the orchestration engines.
//!
//! Recoverable conditions (storage conflicts, transport failures) are kept
//! separate from `ContractViolation`, which signals a programming error and
//! must never be retried.

use thiserror::Error;

/// Errors surfaced by the engines and the contracts they consume.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Compare-on-write mismatch: another writer touched the same entity.
    /// Retried by reloading state and reapplying the message.
    #[error("storage conflict on key {key}")]
    Conflict { key: String },

    /// Storage backend failure (I/O, connectivity).
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport/dispatch failure.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A message that cannot legally reach this engine in its current state.
    /// Fatal: logged, never retried.
    #[error("contract violation: {0}")]
    ContractViolation(String),
}

impl EngineError {
    /// True for the compare-on-write conflict variant.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    /// True when redelivering the message cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::ContractViolation(_))
    }
}

/// Result type alias used across the engine crates.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let err = EngineError::Conflict { key: "w-1".into() };
        assert!(err.is_conflict());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_contract_violation_is_fatal() {
        let err = EngineError::ContractViolation("unknown message kind".into());
        assert!(err.is_fatal());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::Conflict { key: "w-9".into() };
        assert_eq!(err.to_string(), "storage conflict on key w-9");
    }
}
