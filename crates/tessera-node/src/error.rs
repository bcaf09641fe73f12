use thiserror::Error;

use tessera_store::Retryable;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid key: {0}")]
    Key(#[from] tessera_types::TypeError),

    #[error("store error: {0}")]
    Store(#[from] tessera_store::StoreError),

    #[error("crdt error: {0}")]
    Crdt(#[from] tessera_crdt::CrdtError),

    #[error("clock error: {0}")]
    Clock(#[from] tessera_clock::ClockError),

    #[error("sync error: {0}")]
    Sync(#[from] tessera_sync::SyncError),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Returns `true` if the failure is a transaction conflict, however deep
    /// it is wrapped.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Store(e) => e.is_conflict(),
            Self::Clock(e) => e.is_conflict(),
            Self::Sync(e) => e.is_conflict(),
            _ => false,
        }
    }
}

impl Retryable for NodeError {
    fn is_conflict(&self) -> bool {
        NodeError::is_conflict(self)
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
