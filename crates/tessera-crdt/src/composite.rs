use std::collections::{BTreeMap, BTreeSet};

use tessera_types::{Cid, FieldId};

use crate::block::CommitBlock;
use crate::delta::{Delta, ScalarValue};
use crate::error::{CrdtError, CrdtResult};
use crate::schema::SchemaVersion;

/// Document-level register linking per-field sub-DAGs into one DAG.
///
/// A composite commit records, for each field, the head of that field's
/// sub-DAG at composition time. Merging composite heads unions their
/// mappings; a field that maps to different heads is resolved by that
/// field's own register.
pub struct CompositeRegister;

impl CompositeRegister {
    /// The delta recording `fields` as the document's field heads.
    pub fn delta(fields: BTreeMap<FieldId, Cid>) -> Delta {
        Delta::Composite { fields }
    }

    /// Check that every field named by a composite delta is declared.
    pub fn validate(schema: &SchemaVersion, delta: &Delta) -> CrdtResult<()> {
        match delta {
            Delta::Composite { fields } => {
                if let Some(field) = fields.keys().find(|f| schema.kind_of(f).is_none()) {
                    return Err(CrdtError::IncompatibleDelta(format!(
                        "composite references field {field} not declared in schema {}",
                        schema.id
                    )));
                }
                Ok(())
            }
            other => Err(CrdtError::IncompatibleDelta(format!(
                "document-level commit expects a composite delta, got {}",
                other.kind_name()
            ))),
        }
    }

    /// Union of the field mappings of `heads`: every field with the set of
    /// sub-DAG heads the composite heads disagree on (one entry when they
    /// agree).
    pub fn merge<'a, I>(heads: I) -> CrdtResult<BTreeMap<FieldId, BTreeSet<Cid>>>
    where
        I: IntoIterator<Item = &'a CommitBlock>,
    {
        let mut merged: BTreeMap<FieldId, BTreeSet<Cid>> = BTreeMap::new();
        for head in heads {
            match head.delta() {
                Delta::Composite { fields } => {
                    for (field, cid) in fields {
                        merged.entry(field.clone()).or_default().insert(*cid);
                    }
                }
                other => {
                    return Err(CrdtError::IncompatibleDelta(format!(
                        "commit {} carries a {} delta, not composite",
                        head.cid(),
                        other.kind_name()
                    )))
                }
            }
        }
        Ok(merged)
    }

    /// Resolve the visible document from its composite heads, delegating each
    /// field's candidate heads to `resolve_field`.
    ///
    /// Fields whose register resolves to `None` are omitted.
    pub fn resolve<'a, I, F>(heads: I, mut resolve_field: F) -> CrdtResult<BTreeMap<FieldId, ScalarValue>>
    where
        I: IntoIterator<Item = &'a CommitBlock>,
        F: FnMut(&FieldId, &BTreeSet<Cid>) -> CrdtResult<Option<ScalarValue>>,
    {
        let mut document = BTreeMap::new();
        for (field, candidates) in Self::merge(heads)? {
            if let Some(value) = resolve_field(&field, &candidates)? {
                document.insert(field, value);
            }
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::FieldKind;
    use crate::lww::LwwRegister;
    use tessera_types::{DocKey, SchemaVersionId};

    fn fid(name: &str) -> FieldId {
        FieldId::new(name).unwrap()
    }

    fn v1() -> SchemaVersionId {
        SchemaVersionId::new("v1").unwrap()
    }

    fn field_commit(field: &str, parents: &[(Cid, u64)], value: &str) -> CommitBlock {
        CommitBlock::build(
            DocKey::new("doc1").unwrap(),
            Some(fid(field)),
            parents,
            LwwRegister::delta(value.into()),
            v1(),
        )
        .unwrap()
    }

    fn composite(parents: &[(Cid, u64)], fields: &[(&str, &CommitBlock)]) -> CommitBlock {
        let map = fields.iter().map(|(f, b)| (fid(f), b.cid())).collect();
        CommitBlock::build(
            DocKey::new("doc1").unwrap(),
            None,
            parents,
            CompositeRegister::delta(map),
            v1(),
        )
        .unwrap()
    }

    #[test]
    fn merge_unions_mappings() {
        let name = field_commit("name", &[], "Alice");
        let age = field_commit("age", &[], "30");
        let left = composite(&[], &[("name", &name)]);
        let right = composite(&[], &[("age", &age)]);

        let merged = CompositeRegister::merge([&left, &right]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[&fid("name")], BTreeSet::from([name.cid()]));
        assert_eq!(merged[&fid("age")], BTreeSet::from([age.cid()]));
    }

    #[test]
    fn conflicting_field_is_delegated() {
        let root = field_commit("name", &[], "root");
        let alice = field_commit("name", &[(root.cid(), 0)], "Alice");
        let bob = field_commit("name", &[(root.cid(), 0)], "Bob");
        let left = composite(&[], &[("name", &alice)]);
        let right = composite(&[], &[("name", &bob)]);
        let blocks = [alice.clone(), bob.clone()];

        let document = CompositeRegister::resolve([&left, &right], |_, candidates| {
            assert_eq!(candidates.len(), 2);
            let chosen = blocks.iter().filter(|b| candidates.contains(&b.cid()));
            LwwRegister::resolve(chosen)
        })
        .unwrap();

        let expected = LwwRegister::resolve([&alice, &bob]).unwrap().unwrap();
        assert_eq!(document[&fid("name")], expected);
    }

    #[test]
    fn merge_rejects_field_commits() {
        let name = field_commit("name", &[], "Alice");
        assert!(CompositeRegister::merge([&name]).is_err());
    }

    #[test]
    fn validate_requires_declared_fields() {
        let schema = SchemaVersion::new(v1()).with_field(fid("name"), FieldKind::String);
        let ok = CompositeRegister::delta(BTreeMap::from([(fid("name"), Cid::new(Cid::DAG_COMMIT, [1; 32]))]));
        let bad = CompositeRegister::delta(BTreeMap::from([(fid("email"), Cid::new(Cid::DAG_COMMIT, [1; 32]))]));
        assert!(CompositeRegister::validate(&schema, &ok).is_ok());
        assert!(CompositeRegister::validate(&schema, &bad).is_err());
        assert!(CompositeRegister::validate(&schema, &LwwRegister::delta("x".into())).is_err());
    }
}
