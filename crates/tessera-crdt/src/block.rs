//! Immutable, content-addressed commit blocks.
//!
//! # Canonical encoding
//!
//! A block is encoded with bincode from a fixed-layout payload. Links are
//! sorted and deduplicated before encoding and composite deltas use an
//! ordered map, so logically identical commits always encode to identical
//! bytes no matter how they were constructed. The CID is the
//! [`ContentAddresser::COMMIT`] address of those bytes and is never part of
//! the payload itself.
//!
//! Decoding rejects any byte string that does not re-encode identically, so
//! every accepted block has exactly one valid encoding.

use serde::{Deserialize, Serialize};
use tessera_crypto::ContentAddresser;
use tessera_types::{Cid, DocKey, FieldId, SchemaVersionId};

use crate::delta::Delta;
use crate::error::{CrdtError, CrdtResult};

/// Encoding format version stored in every block.
pub const BLOCK_FORMAT: u8 = 1;

#[derive(Serialize)]
struct PayloadRef<'a> {
    format: u8,
    doc_key: &'a DocKey,
    field: &'a Option<FieldId>,
    priority: u64,
    links: &'a [Cid],
    delta: &'a Delta,
    schema_version: &'a SchemaVersionId,
}

#[derive(Deserialize)]
struct Payload {
    format: u8,
    doc_key: DocKey,
    field: Option<FieldId>,
    priority: u64,
    links: Vec<Cid>,
    delta: Delta,
    schema_version: SchemaVersionId,
}

/// One immutable commit in a document or field DAG.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitBlock {
    cid: Cid,
    doc_key: DocKey,
    field: Option<FieldId>,
    priority: u64,
    links: Vec<Cid>,
    delta: Delta,
    schema_version: SchemaVersionId,
    bytes: Vec<u8>,
}

/// `1 + max(parent priorities)`, or 0 for a root commit.
pub fn next_priority(parent_priorities: impl IntoIterator<Item = u64>) -> u64 {
    parent_priorities
        .into_iter()
        .max()
        .map_or(0, |p| p.saturating_add(1))
}

impl CommitBlock {
    /// Build a new commit linking `parents` (CID and priority of each).
    ///
    /// The priority is derived from the parents, the links are normalized,
    /// and the CID is computed from the canonical encoding.
    pub fn build(
        doc_key: DocKey,
        field: Option<FieldId>,
        parents: &[(Cid, u64)],
        delta: Delta,
        schema_version: SchemaVersionId,
    ) -> CrdtResult<Self> {
        check_shape(field.as_ref(), &delta).map_err(CrdtError::IncompatibleDelta)?;
        let mut links: Vec<Cid> = parents.iter().map(|(cid, _)| *cid).collect();
        links.sort();
        links.dedup();
        let priority = next_priority(parents.iter().map(|(_, p)| *p));
        let bytes = encode(&doc_key, &field, priority, &links, &delta, &schema_version)?;
        let cid = ContentAddresser::COMMIT.address(&bytes);
        Ok(Self {
            cid,
            doc_key,
            field,
            priority,
            links,
            delta,
            schema_version,
            bytes,
        })
    }

    /// Decode block bytes received under the CID `claimed`.
    ///
    /// Fails with [`CrdtError::InvalidBlock`] if the bytes do not address to
    /// `claimed`, do not decode, or are not in canonical form. No partial
    /// result is ever returned.
    pub fn decode(claimed: &Cid, bytes: &[u8]) -> CrdtResult<Self> {
        let invalid = |reason: String| CrdtError::InvalidBlock {
            cid: *claimed,
            reason,
        };
        let computed = ContentAddresser::COMMIT.address(bytes);
        if computed != *claimed {
            return Err(invalid(format!("content addresses to {computed}")));
        }
        let payload: Payload =
            bincode::deserialize(bytes).map_err(|e| invalid(format!("undecodable: {e}")))?;
        if payload.format != BLOCK_FORMAT {
            return Err(invalid(format!("unknown block format {}", payload.format)));
        }
        if payload.links.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("links are not sorted and unique".into()));
        }
        if payload.links.is_empty() != (payload.priority == 0) {
            return Err(invalid(format!(
                "priority {} inconsistent with {} links",
                payload.priority,
                payload.links.len()
            )));
        }
        check_shape(payload.field.as_ref(), &payload.delta).map_err(invalid)?;
        let reencoded = encode(
            &payload.doc_key,
            &payload.field,
            payload.priority,
            &payload.links,
            &payload.delta,
            &payload.schema_version,
        )?;
        if reencoded != bytes {
            return Err(invalid("non-canonical encoding".into()));
        }
        Ok(Self {
            cid: *claimed,
            doc_key: payload.doc_key,
            field: payload.field,
            priority: payload.priority,
            links: payload.links,
            delta: payload.delta,
            schema_version: payload.schema_version,
            bytes: bytes.to_vec(),
        })
    }

    /// Check this block's priority against its parents' priorities.
    pub fn verify_priority(&self, parent_priorities: impl IntoIterator<Item = u64>) -> CrdtResult<()> {
        let expected = next_priority(parent_priorities);
        if self.priority != expected {
            return Err(CrdtError::InvalidBlock {
                cid: self.cid,
                reason: format!("priority {} but parents imply {expected}", self.priority),
            });
        }
        Ok(())
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn doc_key(&self) -> &DocKey {
        &self.doc_key
    }

    /// The versioned field, or `None` for a composite commit.
    pub fn field(&self) -> Option<&FieldId> {
        self.field.as_ref()
    }

    pub fn priority(&self) -> u64 {
        self.priority
    }

    /// Sorted, deduplicated CIDs of the commits this one supersedes.
    pub fn links(&self) -> &[Cid] {
        &self.links
    }

    pub fn delta(&self) -> &Delta {
        &self.delta
    }

    pub fn schema_version(&self) -> &SchemaVersionId {
        &self.schema_version
    }

    /// Canonical encoded bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_composite(&self) -> bool {
        self.field.is_none()
    }

    pub fn is_root(&self) -> bool {
        self.links.is_empty()
    }

    /// Every CID this block depends on: its links, then any CIDs its delta
    /// refers to. Deduplicated.
    pub fn references(&self) -> Vec<Cid> {
        let mut refs = self.links.clone();
        for cid in self.delta.references() {
            if !refs.contains(cid) {
                refs.push(*cid);
            }
        }
        refs
    }
}

fn encode(
    doc_key: &DocKey,
    field: &Option<FieldId>,
    priority: u64,
    links: &[Cid],
    delta: &Delta,
    schema_version: &SchemaVersionId,
) -> CrdtResult<Vec<u8>> {
    let payload = PayloadRef {
        format: BLOCK_FORMAT,
        doc_key,
        field,
        priority,
        links,
        delta,
        schema_version,
    };
    bincode::serialize(&payload).map_err(|e| CrdtError::Serialization(e.to_string()))
}

/// Field commits carry scalar deltas; composite commits carry composite deltas.
fn check_shape(field: Option<&FieldId>, delta: &Delta) -> Result<(), String> {
    match (field, delta) {
        (Some(_), Delta::Lww { .. }) | (None, Delta::Composite { .. }) => Ok(()),
        (Some(field), other) => Err(format!(
            "field {field} cannot carry a {} delta",
            other.kind_name()
        )),
        (None, other) => Err(format!(
            "document-level commit cannot carry a {} delta",
            other.kind_name()
        )),
    }
}
