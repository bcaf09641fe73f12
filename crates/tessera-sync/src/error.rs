use thiserror::Error;

use tessera_clock::ClockError;
use tessera_crdt::CrdtError;
use tessera_protocol::{codes, ProtocolError};
use tessera_store::{Retryable, StoreError};
use tessera_types::{Cid, PeerId};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("{op} to {peer} timed out")]
    Timeout { peer: PeerId, op: &'static str },

    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },

    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("missing ancestors of {head}: {} block(s) could not be fetched", missing.len())]
    MissingAncestors { head: Cid, missing: Vec<Cid> },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Whether the error is a transaction conflict worth retrying.
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::Store(e) => e.is_conflict(),
            SyncError::Clock(e) => e.is_conflict(),
            SyncError::Remote { code, .. } => *code == codes::CONFLICT,
            _ => false,
        }
    }

    /// Whether a received block failed verification.
    pub fn is_invalid_block(&self) -> bool {
        matches!(
            self,
            SyncError::Crdt(CrdtError::InvalidBlock { .. })
                | SyncError::Clock(ClockError::Crdt(CrdtError::InvalidBlock { .. }))
        ) || matches!(self, SyncError::Remote { code, .. } if *code == codes::INVALID)
    }

    /// Status code reported to the requesting peer.
    pub fn code(&self) -> u32 {
        match self {
            SyncError::Remote { code, .. } => *code,
            SyncError::InvalidRequest(_) | SyncError::UnexpectedMessage(_) | SyncError::Protocol(_) => {
                codes::INVALID
            }
            SyncError::MissingAncestors { .. } => codes::MISSING_ANCESTORS,
            SyncError::Crdt(e) | SyncError::Clock(ClockError::Crdt(e)) => crdt_code(e),
            SyncError::Clock(ClockError::MissingAncestors { .. }) => codes::MISSING_ANCESTORS,
            SyncError::Clock(ClockError::WrongKey { .. }) => codes::INVALID,
            SyncError::Store(e) | SyncError::Clock(ClockError::Store(e)) => store_code(e),
            SyncError::Unreachable(_) | SyncError::Timeout { .. } => codes::INTERNAL,
        }
    }
}

fn crdt_code(e: &CrdtError) -> u32 {
    match e {
        CrdtError::InvalidBlock { .. } => codes::INVALID,
        CrdtError::IncompatibleDelta(_) => codes::INCOMPATIBLE_DELTA,
        _ => codes::INTERNAL,
    }
}

fn store_code(e: &StoreError) -> u32 {
    if e.is_not_found() {
        codes::NOT_FOUND
    } else if e.is_conflict() {
        codes::CONFLICT
    } else {
        codes::INTERNAL
    }
}

impl Retryable for SyncError {
    fn is_conflict(&self) -> bool {
        SyncError::is_conflict(self)
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
