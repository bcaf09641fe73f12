use crate::error::StoreResult;

/// Transactional key-value backend.
///
/// Implementations must provide:
/// - Isolation: of two transactions that touch the same key, the one that
///   commits second fails with [`StoreError::Conflict`](crate::StoreError::Conflict)
///   instead of interleaving partial updates.
/// - Durability of committed writes for the lifetime of the store.
/// - Full rollback of staged writes on discard.
pub trait TxnStore: Send + Sync {
    /// Open a new transaction. Read-only transactions reject writes.
    fn begin(&self, readonly: bool) -> StoreResult<Box<dyn KvTxn>>;
}

/// One open transaction against a [`TxnStore`].
///
/// Reads observe the transaction's own staged writes.
pub trait KvTxn: Send {
    /// Whether this transaction was opened read-only.
    fn is_readonly(&self) -> bool;

    /// Read a value. Returns `Ok(None)` if the key does not exist.
    fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Check whether a key exists.
    fn has(&mut self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Stage a write.
    fn put(&mut self, key: &[u8], value: Vec<u8>) -> StoreResult<()>;

    /// Stage a deletion. Deleting a missing key is not an error.
    fn delete(&mut self, key: &[u8]) -> StoreResult<()>;

    /// All live entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&mut self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically apply all staged writes.
    fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Drop all staged writes.
    fn discard(self: Box<Self>);
}
