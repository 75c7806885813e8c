//! Store error model.

use thiserror::Error;

/// Result type used by store implementations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store-level error.
///
/// These are surfaced synchronously to the caller; stores never fall back to
/// silent defaults.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A record with the same id already exists.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// No record with the given id exists.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's lease on the record expired and was taken over, or the
    /// record is leased to someone else.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// The backend failed (lock poisoning, IO, serialization).
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn duplicate_key(id: impl ToString) -> Self {
        Self::DuplicateKey(id.to_string())
    }

    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound(id.to_string())
    }

    pub fn lease_lost(id: impl ToString) -> Self {
        Self::LeaseLost(id.to_string())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Maps a poisoned lock guard; usable directly in `map_err`.
    pub fn lock_poisoned<T>(_: T) -> Self {
        Self::Storage("lock poisoned".to_string())
    }
}

/// Error building a `QuerySpec` from untyped input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("unknown sort order: {0}")]
    UnknownSortOrder(String),
}
