use tessera_types::{Cid, TypeError};

/// Errors from commit encoding and register validation.
#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    /// Received block bytes are malformed or do not match their claimed CID.
    #[error("invalid block {cid}: {reason}")]
    InvalidBlock { cid: Cid, reason: String },

    /// A delta does not fit the schema version it claims.
    #[error("incompatible delta: {0}")]
    IncompatibleDelta(String),

    /// Encoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result alias for CRDT operations.
pub type CrdtResult<T> = Result<T, CrdtError>;
