//! The error type shared by every strata crate.
//!
//! One enum with structured variants for the cases callers branch on.
//! Failures the engine cannot shed — allocation failure while a physical
//! multi-index update is half applied, functional-index key computation
//! failure — are deliberately *not* represented here: those panic, because
//! unwinding through half-mutated index chains cannot be made safe.

use thiserror::Error;

/// Primary error type for strata operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrataError {
    /// A unique index already holds a visible tuple with this key.
    #[error("duplicate key in unique index '{index}'")]
    DuplicateKey {
        /// Name of the violated index.
        index: String,
    },

    /// A replace required an existing tuple but none was visible.
    #[error("tuple to be replaced was not found in index '{index}'")]
    TupleNotFound {
        /// Name of the index that was consulted.
        index: String,
    },

    /// The transaction was aborted or demoted by a conflicting writer and
    /// cannot proceed to commit.
    #[error("transaction has been aborted by conflict")]
    TransactionConflict,

    /// An operation was issued against a transaction in the wrong state.
    #[error("transaction is {actual}, expected {expected}")]
    InvalidTransactionState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The transaction id is not registered with the engine.
    #[error("unknown transaction")]
    UnknownTransaction,

    /// The space id is not registered with the engine.
    #[error("unknown space")]
    UnknownSpace,

    /// A space definition is invalid (no primary index, non-unique primary
    /// index, empty key).
    #[error("invalid space definition: {reason}")]
    InvalidSpaceDef { reason: String },

    /// Multikey indexes are not supported by the transaction engine.
    #[error("multikey index '{index}' is not supported by the transaction engine")]
    MultikeyUnsupported {
        /// Name of the offending index.
        index: String,
    },
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = StrataError::DuplicateKey {
            index: "pk".into(),
        };
        assert_eq!(err.to_string(), "duplicate key in unique index 'pk'");
        assert_eq!(
            StrataError::TransactionConflict.to_string(),
            "transaction has been aborted by conflict"
        );
    }
}
