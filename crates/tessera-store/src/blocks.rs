use tessera_crypto::ContentAddresser;
use tessera_types::Cid;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::txn::Transaction;

const BLOCK_PREFIX: &[u8] = b"/blocks/";

fn block_key(cid: &Cid) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_PREFIX.len() + 70);
    key.extend_from_slice(BLOCK_PREFIX);
    key.extend_from_slice(cid.to_hex().as_bytes());
    key
}

/// Content-addressed commit block storage, scoped to a [`Transaction`].
///
/// Blocks are stored verbatim under their CID. The store never interprets
/// block contents beyond checking that the bytes address to the CID.
/// Writing a CID that already exists is a no-op; blocks are never
/// overwritten or deleted.
pub struct BlockStore<'t> {
    txn: &'t mut Transaction,
}

impl<'t> BlockStore<'t> {
    pub(crate) fn new(txn: &'t mut Transaction) -> Self {
        Self { txn }
    }

    /// Read the bytes of a block. Fails with [`StoreError::NotFound`] if the
    /// block is not stored.
    pub fn get(&mut self, cid: &Cid) -> StoreResult<Vec<u8>> {
        self.txn
            .kv()?
            .get(&block_key(cid))?
            .ok_or_else(|| StoreError::NotFound(format!("block {cid}")))
    }

    /// Check whether a block is stored.
    pub fn has(&mut self, cid: &Cid) -> StoreResult<bool> {
        self.txn.kv()?.has(&block_key(cid))
    }

    /// Store a block. Returns `true` if the block was newly written and
    /// `false` if it was already present.
    ///
    /// Fails with [`StoreError::HashMismatch`] if `data` does not address to
    /// `cid`.
    pub fn put(&mut self, cid: &Cid, data: &[u8]) -> StoreResult<bool> {
        let computed = ContentAddresser::COMMIT.address(data);
        if computed != *cid {
            return Err(StoreError::HashMismatch {
                claimed: *cid,
                computed,
            });
        }
        let key = block_key(cid);
        let kv = self.txn.kv()?;
        if kv.has(&key)? {
            return Ok(false);
        }
        kv.put(&key, data.to_vec())?;
        debug!(cid = %cid.short_hex(), size = data.len(), "stored block");
        Ok(true)
    }
}
