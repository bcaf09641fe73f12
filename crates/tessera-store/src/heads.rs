//! Per-(document, field) head sets.
//!
//! Each head is its own key so that concurrent writers touching different
//! documents or fields never contend:
//!
//! ```text
//! /heads/<doc>/c/<cid-hex>            composite (document-level) heads
//! /heads/<doc>/f/<field>/<cid-hex>    field heads
//! ```
//!
//! The value is the head's priority as 8 big-endian bytes, so the head set
//! can be read without loading blocks.

use std::collections::BTreeMap;
use std::fmt;

use tessera_types::{Cid, DocKey, FieldId};

use crate::error::{StoreError, StoreResult};
use crate::txn::Transaction;

const HEAD_PREFIX: &str = "/heads/";

/// Key of one head set: a document's composite DAG or one of its fields.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadKey {
    pub doc_key: DocKey,
    /// `None` addresses the composite (document-level) DAG.
    pub field: Option<FieldId>,
}

impl HeadKey {
    /// Head set of a single field.
    pub fn field(doc_key: DocKey, field: FieldId) -> Self {
        Self {
            doc_key,
            field: Some(field),
        }
    }

    /// Head set of the document-level composite DAG.
    pub fn composite(doc_key: DocKey) -> Self {
        Self {
            doc_key,
            field: None,
        }
    }

    pub fn is_composite(&self) -> bool {
        self.field.is_none()
    }

    fn prefix(&self) -> String {
        match &self.field {
            Some(field) => format!("{HEAD_PREFIX}{}/f/{field}/", self.doc_key),
            None => format!("{HEAD_PREFIX}{}/c/", self.doc_key),
        }
    }

    fn entry_key(&self, cid: &Cid) -> Vec<u8> {
        format!("{}{}", self.prefix(), cid.to_hex()).into_bytes()
    }
}

impl fmt::Debug for HeadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeadKey({self})")
    }
}

impl fmt::Display for HeadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}/{field}", self.doc_key),
            None => write!(f, "{}/*", self.doc_key),
        }
    }
}

fn decode_priority(key: &[u8], value: &[u8]) -> StoreResult<u64> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| StoreError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: format!("priority must be 8 bytes, got {}", value.len()),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_cid(key: &[u8], hex: &str) -> StoreResult<Cid> {
    Cid::from_hex(hex).map_err(|e| StoreError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })
}

/// Head set storage, scoped to a [`Transaction`].
///
/// A missing head set reads as empty; that is the state of a document or
/// field that has never been written.
pub struct HeadStore<'t> {
    txn: &'t mut Transaction,
}

impl<'t> HeadStore<'t> {
    pub(crate) fn new(txn: &'t mut Transaction) -> Self {
        Self { txn }
    }

    /// Current heads of `key` with their priorities, ordered by CID.
    pub fn get(&mut self, key: &HeadKey) -> StoreResult<Vec<(Cid, u64)>> {
        let prefix = key.prefix();
        let entries = self.txn.kv()?.scan_prefix(prefix.as_bytes())?;
        let mut heads = Vec::with_capacity(entries.len());
        for (raw_key, value) in entries {
            let hex = String::from_utf8_lossy(&raw_key[prefix.len()..]).into_owned();
            heads.push((decode_cid(&raw_key, &hex)?, decode_priority(&raw_key, &value)?));
        }
        heads.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(heads)
    }

    /// Priority of one head. Fails with [`StoreError::NotFound`] if `cid` is
    /// not a head of `key`.
    pub fn priority(&mut self, key: &HeadKey, cid: &Cid) -> StoreResult<u64> {
        let entry = key.entry_key(cid);
        match self.txn.kv()?.get(&entry)? {
            Some(value) => decode_priority(&entry, &value),
            None => Err(StoreError::NotFound(format!("head {cid} of {key}"))),
        }
    }

    /// Whether `cid` is currently a head of `key`.
    pub fn has(&mut self, key: &HeadKey, cid: &Cid) -> StoreResult<bool> {
        self.txn.kv()?.has(&key.entry_key(cid))
    }

    /// Add a head.
    pub fn put(&mut self, key: &HeadKey, cid: &Cid, priority: u64) -> StoreResult<()> {
        self.txn
            .kv()?
            .put(&key.entry_key(cid), priority.to_be_bytes().to_vec())
    }

    /// Remove a head.
    pub fn delete(&mut self, key: &HeadKey, cid: &Cid) -> StoreResult<()> {
        self.txn.kv()?.delete(&key.entry_key(cid))
    }

    /// Replace the head set of `key`, touching only entries that change.
    pub fn replace(&mut self, key: &HeadKey, heads: &[(Cid, u64)]) -> StoreResult<()> {
        let current: BTreeMap<Cid, u64> = self.get(key)?.into_iter().collect();
        let next: BTreeMap<Cid, u64> = heads.iter().copied().collect();
        for cid in current.keys().filter(|cid| !next.contains_key(*cid)) {
            self.delete(key, cid)?;
        }
        for (cid, priority) in &next {
            if current.get(cid) != Some(priority) {
                self.put(key, cid, *priority)?;
            }
        }
        Ok(())
    }

    /// Every head of every key belonging to `doc_key`.
    pub fn list_document(&mut self, doc_key: &DocKey) -> StoreResult<Vec<(HeadKey, Cid, u64)>> {
        self.list(&format!("{HEAD_PREFIX}{doc_key}/"))
    }

    /// Every head in the store, ordered by document and key.
    pub fn list_all(&mut self) -> StoreResult<Vec<(HeadKey, Cid, u64)>> {
        self.list(HEAD_PREFIX)
    }

    fn list(&mut self, prefix: &str) -> StoreResult<Vec<(HeadKey, Cid, u64)>> {
        let entries = self.txn.kv()?.scan_prefix(prefix.as_bytes())?;
        let mut out = Vec::with_capacity(entries.len());
        for (raw_key, value) in entries {
            let (key, cid) = parse_entry_key(&raw_key)?;
            out.push((key, cid, decode_priority(&raw_key, &value)?));
        }
        Ok(out)
    }
}

fn parse_entry_key(raw_key: &[u8]) -> StoreResult<(HeadKey, Cid)> {
    let corrupt = || StoreError::Corrupt {
        key: String::from_utf8_lossy(raw_key).into_owned(),
        reason: "unrecognized head key layout".into(),
    };
    let text = std::str::from_utf8(raw_key).map_err(|_| corrupt())?;
    let rest = text.strip_prefix(HEAD_PREFIX).ok_or_else(corrupt)?;
    let (doc_key, field, hex) = match rest.split('/').collect::<Vec<_>>().as_slice() {
        [doc, "c", hex] => (*doc, None, *hex),
        [doc, "f", field, hex] => (*doc, Some(*field), *hex),
        _ => return Err(corrupt()),
    };
    let doc_key = DocKey::new(doc_key).map_err(|_| corrupt())?;
    let key = match field {
        Some(field) => HeadKey::field(doc_key, FieldId::new(field).map_err(|_| corrupt())?),
        None => HeadKey::composite(doc_key),
    };
    Ok((key, decode_cid(raw_key, hex)?))
}
