//! Terminal-once transaction wrapper with ordered hook lists.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::blocks::BlockStore;
use crate::error::{StoreError, StoreResult};
use crate::heads::HeadStore;
use crate::traits::{KvTxn, TxnStore};

type Hook = Box<dyn FnOnce() + Send>;

/// Lifecycle state of a [`Transaction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    /// Open; staged operations are allowed.
    Pending,
    /// Durably committed.
    Committed,
    /// Discarded, or failed to commit.
    Discarded,
}

impl TxnState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Discarded => "discarded",
        }
    }
}

/// Atomic scope for one logical operation against the block and head stores.
///
/// A transaction reaches exactly one terminal action:
/// - [`commit`](Self::commit) applies every staged write, then runs the
///   success hooks. If the backend rejects the commit, the error hooks run
///   instead and the transaction counts as discarded.
/// - [`discard`](Self::discard) drops every staged write and runs the error
///   hooks.
///
/// Hooks run once, in registration order, and are cleared after firing. A
/// panicking hook is logged and does not affect the outcome. Committing a
/// committed transaction and discarding a finished one are no-ops. Dropping a
/// pending transaction discards it.
pub struct Transaction {
    inner: Option<Box<dyn KvTxn>>,
    readonly: bool,
    state: TxnState,
    on_success: Vec<Hook>,
    on_error: Vec<Hook>,
}

impl Transaction {
    /// Wrap a backend transaction.
    pub fn new(inner: Box<dyn KvTxn>) -> Self {
        let readonly = inner.is_readonly();
        Self {
            inner: Some(inner),
            readonly,
            state: TxnState::Pending,
            on_success: Vec::new(),
            on_error: Vec::new(),
        }
    }

    /// Open a new transaction on `store`.
    pub fn begin(store: &dyn TxnStore, readonly: bool) -> StoreResult<Self> {
        Ok(Self::new(store.begin(readonly)?))
    }

    /// Whether this transaction was opened read-only.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Register a hook to run after a successful commit.
    pub fn on_success(&mut self, hook: impl FnOnce() + Send + 'static) {
        if self.state != TxnState::Pending {
            debug!(state = self.state.as_str(), "ignoring success hook on finished transaction");
            return;
        }
        self.on_success.push(Box::new(hook));
    }

    /// Register a hook to run after a discard or a failed commit.
    pub fn on_error(&mut self, hook: impl FnOnce() + Send + 'static) {
        if self.state != TxnState::Pending {
            debug!(state = self.state.as_str(), "ignoring error hook on finished transaction");
            return;
        }
        self.on_error.push(Box::new(hook));
    }

    /// Scoped access to the block store.
    pub fn blocks(&mut self) -> BlockStore<'_> {
        BlockStore::new(self)
    }

    /// Scoped access to the head store.
    pub fn heads(&mut self) -> HeadStore<'_> {
        HeadStore::new(self)
    }

    /// Commit all staged writes.
    pub fn commit(&mut self) -> StoreResult<()> {
        match self.state {
            TxnState::Committed => return Ok(()),
            TxnState::Discarded => return Err(StoreError::TxnClosed("discarded")),
            TxnState::Pending => {}
        }
        let inner = self
            .inner
            .take()
            .ok_or(StoreError::TxnClosed("discarded"))?;
        match inner.commit() {
            Ok(()) => {
                self.state = TxnState::Committed;
                self.on_error.clear();
                fire(std::mem::take(&mut self.on_success), "success");
                Ok(())
            }
            Err(e) => {
                self.state = TxnState::Discarded;
                self.on_success.clear();
                fire(std::mem::take(&mut self.on_error), "error");
                Err(e)
            }
        }
    }

    /// Drop all staged writes. No effect once the transaction has finished.
    pub fn discard(&mut self) {
        if self.state != TxnState::Pending {
            return;
        }
        if let Some(inner) = self.inner.take() {
            inner.discard();
        }
        self.state = TxnState::Discarded;
        self.on_success.clear();
        fire(std::mem::take(&mut self.on_error), "error");
    }

    pub(crate) fn kv(&mut self) -> StoreResult<&mut (dyn KvTxn + 'static)> {
        match self.inner.as_deref_mut() {
            Some(inner) => Ok(inner),
            None => Err(StoreError::TxnClosed(self.state.as_str())),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Pending {
            debug!("discarding unfinished transaction");
            self.discard();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("readonly", &self.readonly)
            .field("success_hooks", &self.on_success.len())
            .field("error_hooks", &self.on_error.len())
            .finish()
    }
}

fn fire(hooks: Vec<Hook>, kind: &'static str) {
    for (index, hook) in hooks.into_iter().enumerate() {
        if catch_unwind(AssertUnwindSafe(hook)).is_err() {
            warn!(kind, index, "transaction hook panicked");
        }
    }
}
