use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("unsupported cid: {0}")]
    UnsupportedCid(String),

    #[error("invalid {kind} {value:?}: {reason}")]
    InvalidKey {
        kind: &'static str,
        value: String,
        reason: String,
    },
}
