//! Error kinds shared by every storage backend.

use thiserror::Error;

/// Result alias used throughout the storage layer.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors a [`crate::Store`] implementation can surface.
///
/// `NotFound` is deliberately absent: missing keys are represented as
/// `Ok(None)` on read operations, not as an error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient or permanent I/O failure, including an exhausted retry
    /// budget inside a backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored blob could not be decoded back into the expected entity
    /// type.
    #[error("failed to decode stored value for key {key}: {source}")]
    Serialization {
        /// Key whose value failed to decode.
        key: String,
        /// Underlying decode failure.
        #[source]
        source: anyhow::Error,
    },

    /// Backend-declared maximum per-value size was exceeded on save.
    #[error("value for key {key} exceeds the backend's size limit of {limit} bytes")]
    SizeLimit {
        /// Key that was being saved.
        key: String,
        /// Configured maximum.
        limit: usize,
    },

    /// Caller supplied an expected version that differs from the version
    /// currently stored.
    #[error("optimistic concurrency conflict on key {key}: expected version {expected}, found {actual}")]
    Conflict {
        /// Key in conflict.
        key: String,
        /// Version the caller expected.
        expected: u64,
        /// Version actually stored.
        actual: u64,
    },

    /// Any other backend failure that does not fit the variants above.
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Errors classified as transient can be retried by
/// [`crate::retry`]-style helpers; everything else should propagate
/// immediately.
pub trait Classify {
    /// `true` if retrying the operation that produced this error stands a
    /// reasonable chance of succeeding.
    fn is_transient(&self) -> bool;
}

impl Classify for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}
