//! Error taxonomy of the scheduler.
//!
//! [`Error`] is cloneable so that it can be stored on graph nodes, in status
//! records and in the transaction history. Descriptors report their own
//! failures as [`Error::Southbound`]; the executor wraps those into
//! [`Error::Operation`] together with the key and the operation that failed.

use crate::txn::TxnOperation;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used throughout the scheduler.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the scheduler and by descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
    /// Descriptor `validate` rejected the value.
    #[error("invalid value: {message}")]
    InvalidValue {
        message: String,
        /// Names of the offending fields, if the descriptor reported any.
        fields: Vec<String>,
    },

    /// Failure reported by a descriptor CRUD callback.
    #[error("{message}")]
    Southbound { message: String, retriable: bool },

    /// A Create/Update/Delete call failed for a given key.
    #[error("{op} of {key} failed: {message}")]
    Operation {
        key: String,
        op: TxnOperation,
        message: String,
        retriable: bool,
    },

    /// The value cannot be applied because some dependencies are missing.
    #[error("unsatisfied dependencies of {key}: {}", .labels.join(", "))]
    UnsatisfiedDependency { key: String, labels: Vec<String> },

    /// A cycle among required dependencies.
    #[error("cyclic dependency between {}", .keys.join(", "))]
    CyclicDependency { keys: Vec<String> },

    #[error("descriptor {name} cannot be registered: {reason}")]
    DuplicateDescriptor { name: String, reason: String },

    #[error("unknown descriptor: {0}")]
    UnknownDescriptor(String),

    /// More than one descriptor claims the key.
    #[error("key {key} is owned by multiple descriptors: {}", .descriptors.join(", "))]
    AmbiguousKey { key: String, descriptors: Vec<String> },

    /// No descriptor claims the key.
    #[error("no descriptor implements key {0}")]
    UnimplementedKey(String),

    #[error("invalid transaction options: {0}")]
    InvalidTxnOptions(String),

    #[error("transaction queue is full")]
    QueueFull,

    #[error("scheduler is closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates an invalid-value error without field details.
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidValue {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Creates an invalid-value error pointing at specific fields.
    pub fn invalid_fields<I, S>(message: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Error::InvalidValue {
            message: message.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a retriable southbound failure.
    pub fn southbound(message: impl Into<String>) -> Self {
        Error::Southbound {
            message: message.into(),
            retriable: true,
        }
    }

    /// Creates a southbound failure that retrying will not fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Southbound {
            message: message.into(),
            retriable: false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Wraps a descriptor error into an [`Error::Operation`] for `key`.
    ///
    /// Validation errors are kept as they are.
    pub fn into_operation(self, key: &str, op: TxnOperation, retriable: bool) -> Self {
        match self {
            Error::InvalidValue { .. } | Error::Operation { .. } => self,
            other => Error::Operation {
                key: key.to_string(),
                op,
                message: other.to_string(),
                retriable,
            },
        }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Southbound { retriable, .. } | Error::Operation { retriable, .. } => *retriable,
            Error::QueueFull => true,
            _ => false,
        }
    }

    /// Returns the offending fields of an invalid value.
    pub fn invalid_fields_of(&self) -> &[String] {
        match self {
            Error::InvalidValue { fields, .. } => fields,
            _ => &[],
        }
    }
}

/// A per-key error reported back to the transaction caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWithError {
    pub key: String,
    pub operation: TxnOperation,
    pub error: Error,
}

impl std::fmt::Display for KeyWithError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.key, self.operation, self.error)
    }
}

/// Failure of a whole transaction as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// The transaction was never executed.
    #[error("transaction rejected: {0}")]
    Rejected(#[from] Error),

    /// Some values could not be applied.
    #[error("{}", describe_failure(.seq_num, .errors, .reverted))]
    Failed {
        seq_num: u64,
        errors: Vec<KeyWithError>,
        reverted: bool,
    },
}

fn describe_failure(seq_num: &u64, errors: &[KeyWithError], reverted: &bool) -> String {
    format!(
        "transaction {} failed for {} value(s){}: {}",
        seq_num,
        errors.len(),
        if *reverted { " and was reverted" } else { "" },
        errors.iter().join("; ")
    )
}

impl TransactionError {
    /// Returns the per-key errors, empty for a rejected transaction.
    pub fn key_errors(&self) -> &[KeyWithError] {
        match self {
            TransactionError::Rejected(_) => &[],
            TransactionError::Failed { errors, .. } => errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_southbound_is_retriable() {
        assert!(Error::southbound("busy").is_retriable());
        assert!(!Error::fatal("bad handle").is_retriable());
        assert!(!Error::invalid("mac").is_retriable());
    }

    #[test]
    fn test_into_operation_keeps_retriable_flag() {
        let err = Error::southbound("timeout").into_operation("config/a", TxnOperation::Create, false);
        assert_eq!(
            err,
            Error::Operation {
                key: "config/a".into(),
                op: TxnOperation::Create,
                message: "timeout".into(),
                retriable: false,
            }
        );
        assert_eq!(err.to_string(), "CREATE of config/a failed: timeout");
    }

    #[test]
    fn test_into_operation_passes_validation_errors() {
        let err = Error::invalid_fields("bad mac", ["mac"]);
        assert_eq!(err.clone().into_operation("k", TxnOperation::Update, true), err);
        assert_eq!(err.invalid_fields_of(), &["mac".to_string()]);
    }

    #[test]
    fn test_failed_transaction_message() {
        let err = TransactionError::Failed {
            seq_num: 4,
            errors: vec![KeyWithError {
                key: "config/a".into(),
                operation: TxnOperation::Create,
                error: Error::southbound("down"),
            }],
            reverted: true,
        };
        assert_eq!(
            err.to_string(),
            "transaction 4 failed for 1 value(s) and was reverted: config/a (CREATE): down"
        );
        assert_eq!(err.key_errors().len(), 1);
    }
}
