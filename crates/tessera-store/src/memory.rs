//! In-memory transactional store with optimistic conflict detection.
//!
//! [`MemoryStore`] keeps every key in a `BTreeMap` behind a `RwLock`. Each
//! committed write stamps the key with the store's commit sequence number;
//! deletions leave a stamped tombstone so they are visible to validation.
//!
//! A transaction remembers the sequence number it started at, every key it
//! read or wrote, and every prefix it scanned. At commit time, if any of
//! those keys (or any key under a scanned prefix) was stamped after the
//! transaction started, the commit fails with [`StoreError::Conflict`] and
//! nothing is applied. First committer wins.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::{KvTxn, TxnStore};

#[derive(Clone, Debug)]
struct Entry {
    /// `None` marks a tombstone.
    value: Option<Vec<u8>>,
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<Vec<u8>, Entry>,
    seq: u64,
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(format!("lock poisoned: {e}"))
}

fn key_label(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

/// In-memory, `BTreeMap`-based transactional store.
///
/// Intended for tests and embedding. Cloning shares the same underlying data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-tombstoned) keys.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.data.values().filter(|e| e.value.is_some()).count())
            .unwrap_or(0)
    }

    /// Returns `true` if no live keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful read-write commits so far.
    pub fn commit_seq(&self) -> u64 {
        self.inner.read().map(|inner| inner.seq).unwrap_or(0)
    }
}

impl TxnStore for MemoryStore {
    fn begin(&self, readonly: bool) -> StoreResult<Box<dyn KvTxn>> {
        let start = self.inner.read().map_err(poisoned)?.seq;
        Ok(Box::new(MemoryTxn {
            inner: Arc::clone(&self.inner),
            readonly,
            start,
            reads: BTreeSet::new(),
            scans: Vec::new(),
            writes: BTreeMap::new(),
        }))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("live_keys", &self.len())
            .field("commit_seq", &self.commit_seq())
            .finish()
    }
}

/// A transaction against a [`MemoryStore`].
struct MemoryTxn {
    inner: Arc<RwLock<Inner>>,
    readonly: bool,
    start: u64,
    reads: BTreeSet<Vec<u8>>,
    scans: Vec<Vec<u8>>,
    /// Staged writes; `None` stages a deletion.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl MemoryTxn {
    fn check_writable(&self) -> StoreResult<()> {
        if self.readonly {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// First key whose committed version is newer than this transaction.
    fn find_conflict(&self, inner: &Inner) -> Option<Vec<u8>> {
        let stale = |key: &Vec<u8>| {
            inner
                .data
                .get(key)
                .is_some_and(|entry| entry.version > self.start)
        };
        if let Some(key) = self.reads.iter().chain(self.writes.keys()).find(|key| stale(*key)) {
            return Some(key.clone());
        }
        for prefix in &self.scans {
            let hit = inner
                .data
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .find(|(_, entry)| entry.version > self.start);
            if let Some((key, _)) = hit {
                return Some(key.clone());
            }
        }
        None
    }
}

impl KvTxn for MemoryTxn {
    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if let Some(staged) = self.writes.get(key) {
            return Ok(staged.clone());
        }
        let inner = self.inner.read().map_err(poisoned)?;
        let value = inner.data.get(key).and_then(|e| e.value.clone());
        drop(inner);
        self.reads.insert(key.to_vec());
        Ok(value)
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> StoreResult<()> {
        self.check_writable()?;
        self.writes.insert(key.to_vec(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StoreResult<()> {
        self.check_writable()?;
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan_prefix(&mut self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = {
            let inner = self.inner.read().map_err(poisoned)?;
            inner
                .data
                .range(prefix.to_vec()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .filter_map(|(k, e)| e.value.clone().map(|v| (k.clone(), v)))
                .collect()
        };
        for (key, staged) in self
            .writes
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match staged {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        self.scans.push(prefix.to_vec());
        Ok(merged.into_iter().collect())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.readonly || self.writes.is_empty() {
            return Ok(());
        }
        let shared = Arc::clone(&self.inner);
        let mut inner = shared.write().map_err(poisoned)?;
        if let Some(key) = self.find_conflict(&inner) {
            debug!(key = %key_label(&key), start = self.start, "optimistic commit rejected");
            return Err(StoreError::Conflict(key_label(&key)));
        }
        inner.seq += 1;
        let version = inner.seq;
        let MemoryTxn { writes, .. } = *self;
        let count = writes.len();
        for (key, value) in writes {
            inner.data.insert(key, Entry { value, version });
        }
        debug!(version, writes = count, "transaction committed");
        Ok(())
    }

    fn discard(self: Box<Self>) {}
}
