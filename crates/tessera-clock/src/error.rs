//! Error types for the Merkle clock.

use tessera_crdt::CrdtError;
use tessera_store::{Retryable, StoreError};
use tessera_types::Cid;

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// A commit cannot be merged because blocks it depends on are not stored.
    #[error("missing ancestors of {head}: {} block(s) unavailable", missing.len())]
    MissingAncestors {
        /// The commit being merged.
        head: Cid,
        /// The referenced CIDs that could not be found.
        missing: Vec<Cid>,
    },

    /// A commit was offered for a key it does not belong to.
    #[error("commit {cid} belongs to {actual}, not {expected}")]
    WrongKey {
        cid: Cid,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClockError {
    /// Whether the error is a transaction conflict worth retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClockError::Store(e) if e.is_conflict())
    }
}

impl Retryable for ClockError {
    fn is_conflict(&self) -> bool {
        ClockError::is_conflict(self)
    }
}

/// Convenience alias for clock results.
pub type ClockResult<T> = Result<T, ClockError>;
