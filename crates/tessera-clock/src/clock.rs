//! Merkle clock over the commit DAG of each head key.
//!
//! Local writes become commits whose parents are the key's current heads.
//! Received commits are folded in with a dominance check, so a head set only
//! ever holds mutually concurrent commits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use tessera_crdt::{CommitBlock, CompositeRegister, Delta, LwwRegister, ScalarValue, SchemaRegistry};
use tessera_events::{EventBus, UpdateEvent};
use tessera_store::{HeadKey, Transaction};
use tessera_types::{Cid, DocKey, FieldId, SchemaVersionId};

use crate::error::{ClockError, ClockResult};
use crate::walk::{BlockReader, DagWalk};

/// Result of folding received commits into a head set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The head set after the merge, ordered by CID.
    pub heads: Vec<(Cid, u64)>,
    pub added: Vec<Cid>,
    pub removed: Vec<Cid>,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// The Merkle clock: creates commits and keeps head sets consistent.
///
/// All operations run inside a caller-supplied [`Transaction`]; the clock
/// holds no mutable state of its own. When an [`EventBus`] is attached,
/// every local commit schedules an [`UpdateEvent`] that is published only if
/// the transaction commits.
pub struct MerkleClock {
    schemas: Arc<SchemaRegistry>,
    events: Option<Arc<EventBus>>,
}

impl MerkleClock {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            schemas,
            events: None,
        }
    }

    /// Publish update events for local commits on `events`.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    // ---------------------------------------------------------------
    // Local commits
    // ---------------------------------------------------------------

    /// Append a commit carrying `delta` on top of the current heads of
    /// `key`. The new commit links every current head and becomes the only
    /// head.
    pub fn add_delta(
        &self,
        txn: &mut Transaction,
        key: &HeadKey,
        delta: Delta,
        schema_version: &SchemaVersionId,
    ) -> ClockResult<CommitBlock> {
        self.schemas
            .validate(schema_version, key.field.as_ref(), &delta)?;
        let parents = txn.heads().get(key)?;
        let block = CommitBlock::build(
            key.doc_key.clone(),
            key.field.clone(),
            &parents,
            delta,
            schema_version.clone(),
        )?;
        txn.blocks().put(&block.cid(), block.bytes())?;
        txn.heads()
            .replace(key, &[(block.cid(), block.priority())])?;
        debug!(
            %key,
            cid = %block.cid().short_hex(),
            priority = block.priority(),
            parents = parents.len(),
            "added delta"
        );

        if let Some(events) = &self.events {
            let events = Arc::clone(events);
            let event = update_event(&block);
            txn.on_success(move || {
                events.publish(event);
            });
        }
        Ok(block)
    }

    /// Record a document-level commit mapping every field of `doc_key` to
    /// its current head. A field with several concurrent heads is mapped to
    /// the one its register would pick.
    pub fn compose(
        &self,
        txn: &mut Transaction,
        doc_key: &DocKey,
        schema_version: &SchemaVersionId,
    ) -> ClockResult<CommitBlock> {
        let mut chosen: BTreeMap<FieldId, (u64, Cid)> = BTreeMap::new();
        for (key, cid, priority) in txn.heads().list_document(doc_key)? {
            let Some(field) = key.field else { continue };
            let entry = chosen.entry(field).or_insert((priority, cid));
            if (priority, cid) > *entry {
                *entry = (priority, cid);
            }
        }
        let fields = chosen.into_iter().map(|(f, (_, cid))| (f, cid)).collect();
        self.add_delta(
            txn,
            &HeadKey::composite(doc_key.clone()),
            CompositeRegister::delta(fields),
            schema_version,
        )
    }

    // ---------------------------------------------------------------
    // Merging
    // ---------------------------------------------------------------

    /// Fold the stored commits `incoming` into the head set of `key`.
    ///
    /// Each incoming commit and everything it references must already be in
    /// the block store, otherwise nothing is written and
    /// [`ClockError::MissingAncestors`] is returned. An incoming commit that
    /// is an ancestor of a current head is ignored; current heads that are
    /// ancestors of an incoming commit are replaced by it. The head set is
    /// only written when it changes.
    pub fn merge_heads(
        &self,
        txn: &mut Transaction,
        key: &HeadKey,
        incoming: &[Cid],
    ) -> ClockResult<MergeOutcome> {
        let before: BTreeMap<Cid, u64> = txn.heads().get(key)?.into_iter().collect();
        let mut heads = before.clone();
        let mut incoming = incoming.to_vec();
        incoming.sort();
        incoming.dedup();

        {
            let mut reader = BlockReader::new(txn);
            for cid in &incoming {
                if heads.contains_key(cid) {
                    continue;
                }
                let block = match reader.load(cid) {
                    Err(ClockError::Store(e)) if e.is_not_found() => {
                        return Err(ClockError::MissingAncestors {
                            head: *cid,
                            missing: vec![*cid],
                        })
                    }
                    other => other?,
                };
                check_key(key, &block)?;
                let missing = reader.missing_references(&block)?;
                if !missing.is_empty() {
                    return Err(ClockError::MissingAncestors { head: *cid, missing });
                }

                let mut dominated = false;
                for head in heads.keys() {
                    if reader.is_ancestor(cid, block.priority(), head)? {
                        dominated = true;
                        break;
                    }
                }
                if dominated {
                    debug!(%key, cid = %cid.short_hex(), "incoming commit already covered by heads");
                    continue;
                }

                let mut superseded = Vec::new();
                for (head, priority) in &heads {
                    if *priority < block.priority() && reader.is_ancestor(head, *priority, cid)? {
                        superseded.push(*head);
                    }
                }
                for head in &superseded {
                    heads.remove(head);
                }
                heads.insert(*cid, block.priority());
            }
        }

        let outcome = MergeOutcome {
            added: heads.keys().filter(|c| !before.contains_key(c)).copied().collect(),
            removed: before.keys().filter(|c| !heads.contains_key(c)).copied().collect(),
            heads: heads.into_iter().collect(),
        };
        if outcome.changed() {
            txn.heads().replace(key, &outcome.heads)?;
            debug!(
                %key,
                added = outcome.added.len(),
                removed = outcome.removed.len(),
                heads = outcome.heads.len(),
                "merged heads"
            );
        }
        Ok(outcome)
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// The current head commits of `key`, ordered by CID. Empty if the key
    /// has never been written.
    pub fn get_heads(&self, txn: &mut Transaction, key: &HeadKey) -> ClockResult<Vec<CommitBlock>> {
        let heads = txn.heads().get(key)?;
        let mut reader = BlockReader::new(txn);
        heads.iter().map(|(cid, _)| reader.load(cid)).collect()
    }

    /// Walk the history of `key`, most recent commit first.
    pub fn history<'t>(&self, txn: &'t mut Transaction, key: &HeadKey) -> ClockResult<DagWalk<'t>> {
        let heads: Vec<Cid> = txn.heads().get(key)?.into_iter().map(|(cid, _)| cid).collect();
        DagWalk::new(txn, &heads)
    }

    /// The value readers see for one field.
    pub fn resolve_field(&self, txn: &mut Transaction, key: &HeadKey) -> ClockResult<Option<ScalarValue>> {
        let heads = self.get_heads(txn, key)?;
        Ok(LwwRegister::resolve(&heads)?)
    }

    /// The visible document: every field's candidates are its own heads plus
    /// whatever the document-level heads map it to, resolved by the field's
    /// register.
    pub fn resolve_document(
        &self,
        txn: &mut Transaction,
        doc_key: &DocKey,
    ) -> ClockResult<BTreeMap<FieldId, ScalarValue>> {
        let mut candidates: BTreeMap<FieldId, BTreeSet<Cid>> = BTreeMap::new();
        let mut composite_heads = Vec::new();
        for (key, cid, _) in txn.heads().list_document(doc_key)? {
            match key.field {
                Some(field) => {
                    candidates.entry(field).or_default().insert(cid);
                }
                None => composite_heads.push(cid),
            }
        }

        let mut reader = BlockReader::new(txn);
        let composites = composite_heads
            .iter()
            .map(|cid| reader.load(cid))
            .collect::<ClockResult<Vec<_>>>()?;
        for (field, mapped) in CompositeRegister::merge(&composites)? {
            candidates.entry(field).or_default().extend(mapped);
        }

        let mut document = BTreeMap::new();
        for (field, cids) in candidates {
            let blocks = cids
                .iter()
                .map(|cid| reader.load(cid))
                .collect::<ClockResult<Vec<_>>>()?;
            if let Some(value) = LwwRegister::resolve(&blocks)? {
                document.insert(field, value);
            }
        }
        Ok(document)
    }
}

impl std::fmt::Debug for MerkleClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerkleClock")
            .field("events", &self.events.is_some())
            .finish()
    }
}

fn check_key(key: &HeadKey, block: &CommitBlock) -> ClockResult<()> {
    if block.doc_key() != &key.doc_key || block.field() != key.field.as_ref() {
        let actual = HeadKey {
            doc_key: block.doc_key().clone(),
            field: block.field().cloned(),
        };
        return Err(ClockError::WrongKey {
            cid: block.cid(),
            expected: key.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// The update event announcing a committed block.
pub fn update_event(block: &CommitBlock) -> UpdateEvent {
    UpdateEvent {
        doc_key: block.doc_key().clone(),
        field: block.field().cloned(),
        cid: block.cid(),
        priority: block.priority(),
        schema_version: block.schema_version().clone(),
        block: block.bytes().to_vec(),
    }
}
