//! Error vocabulary for the transaction coordinator.

use thiserror::Error;

use kvstore_core::{Classify, StoreError};

use crate::transaction::TransactionState;

/// Result alias used throughout this crate.
pub type TxnResult<T> = Result<T, TxnError>;

/// Errors the transaction coordinator and its helpers can surface.
#[derive(Debug, Error)]
pub enum TxnError {
    /// An operation was attempted against a transaction in a state that
    /// doesn't permit it.
    #[error("transaction is {actual:?}, expected {expected:?}")]
    State {
        /// State the operation required.
        expected: TransactionState,
        /// State the transaction was actually in.
        actual: TransactionState,
    },

    /// `create_savepoint` was called on a transaction created with
    /// savepoints disabled.
    #[error("savepoints are disabled for this transaction")]
    SavepointsDisabled,

    /// `create_savepoint` was called with a name already in use.
    #[error("a savepoint named '{0}' already exists")]
    DuplicateSavepoint(String),

    /// `rollback_to_savepoint` or `release_savepoint` referenced a name
    /// that was never created, or was already released.
    #[error("no savepoint named '{0}' exists")]
    UnknownSavepoint(String),

    /// `rollback_to_savepoint` referenced a savepoint whose enclosing
    /// savepoint was already released; the state it would restore is no
    /// longer intact.
    #[error("savepoint '{0}' cannot be restored: an enclosing savepoint was already released")]
    SavepointParentReleased(String),

    /// At least one enlisted resource's `prepare` failed; the transaction
    /// has already been rolled back on every resource.
    #[error("resource '{resource}' failed to prepare: {cause}")]
    PrepareFailed {
        /// Identifier of the resource whose prepare failed.
        resource: String,
        /// Underlying cause.
        #[source]
        cause: anyhow::Error,
    },

    /// The transaction's wall-clock budget elapsed before it committed.
    #[error("transaction exceeded its configured timeout")]
    Timeout,

    /// `execute_with_retry` was called with `max_retries < 1`.
    #[error("max_retries must be at least 1")]
    InvalidArgument(String),

    /// More than one failure must be reported together (e.g. a failing
    /// transaction body plus a failing rollback).
    #[error("{0}")]
    Aggregate(AggregateError),

    /// Any other resource or backend failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl Classify for TxnError {
    fn is_transient(&self) -> bool {
        match self {
            TxnError::Timeout => true,
            TxnError::Backend(e) => e
                .downcast_ref::<StoreError>()
                .map(|se| matches!(se, StoreError::Io(_) | StoreError::Conflict { .. }))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Two or more causes reported together.
#[derive(Debug)]
pub struct AggregateError(pub Vec<TxnError>);

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "multiple failures occurred: ")?;
        for (i, cause) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
