use tessera_types::Cid;

/// Errors from transactional storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested key or block was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A concurrent transaction committed a conflicting change first.
    /// Retryable with a fresh transaction.
    #[error("transaction conflict on {0}")]
    Conflict(String),

    /// A write was attempted through a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// The transaction already reached its terminal action.
    #[error("transaction already {0}")]
    TxnClosed(&'static str),

    /// Block bytes do not address to the CID they are stored under.
    #[error("hash mismatch: claimed {claimed}, computed {computed}")]
    HashMismatch { claimed: Cid, computed: Cid },

    /// A stored value cannot be decoded.
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Failure inside the storage backend.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns `true` for the retryable write-write conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns `true` if the error reports a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
