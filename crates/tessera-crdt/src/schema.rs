use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tessera_types::{FieldId, SchemaVersionId};
use tracing::debug;

use crate::composite::CompositeRegister;
use crate::delta::{Delta, FieldKind};
use crate::error::{CrdtError, CrdtResult};
use crate::lww::LwwRegister;

/// The field kinds declared by one schema version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub id: SchemaVersionId,
    pub fields: BTreeMap<FieldId, FieldKind>,
}

impl SchemaVersion {
    pub fn new(id: SchemaVersionId) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Declare a field.
    pub fn with_field(mut self, field: FieldId, kind: FieldKind) -> Self {
        self.fields.insert(field, kind);
        self
    }

    pub fn kind_of(&self, field: &FieldId) -> Option<FieldKind> {
        self.fields.get(field).copied()
    }
}

/// Known schema versions, used to validate deltas before they are accepted.
///
/// Schema definition and migration live outside this crate; the registry is
/// only fed the versions that commits may reference.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    versions: RwLock<HashMap<SchemaVersionId, SchemaVersion>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a schema version.
    pub fn register(&self, version: SchemaVersion) -> CrdtResult<()> {
        let mut versions = self
            .versions
            .write()
            .map_err(|e| CrdtError::Serialization(format!("lock poisoned: {e}")))?;
        debug!(schema = %version.id, fields = version.fields.len(), "registered schema version");
        versions.insert(version.id.clone(), version);
        Ok(())
    }

    pub fn get(&self, id: &SchemaVersionId) -> Option<SchemaVersion> {
        self.versions.read().ok()?.get(id).cloned()
    }

    /// Validate a delta for `field` (or the composite, when `None`) against
    /// the schema version it claims.
    ///
    /// Fails with [`CrdtError::IncompatibleDelta`] if the version is unknown,
    /// the field is undeclared, or the delta does not fit the field's kind.
    pub fn validate(
        &self,
        schema_version: &SchemaVersionId,
        field: Option<&FieldId>,
        delta: &Delta,
    ) -> CrdtResult<()> {
        let schema = self.get(schema_version).ok_or_else(|| {
            CrdtError::IncompatibleDelta(format!("unknown schema version {schema_version}"))
        })?;
        match field {
            Some(field) => {
                let kind = schema.kind_of(field).ok_or_else(|| {
                    CrdtError::IncompatibleDelta(format!(
                        "field {field} is not declared in schema {schema_version}"
                    ))
                })?;
                LwwRegister::validate(field, kind, delta)
            }
            None => CompositeRegister::validate(&schema, delta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::ScalarValue;

    fn field(name: &str) -> FieldId {
        FieldId::new(name).unwrap()
    }

    fn registry() -> (SchemaRegistry, SchemaVersionId) {
        let id = SchemaVersionId::new("users-v1").unwrap();
        let registry = SchemaRegistry::new();
        registry
            .register(
                SchemaVersion::new(id.clone())
                    .with_field(field("name"), FieldKind::String)
                    .with_field(field("age"), FieldKind::Int),
            )
            .unwrap();
        (registry, id)
    }

    #[test]
    fn accepts_matching_kind() {
        let (registry, id) = registry();
        let delta = Delta::Lww {
            value: "Alice".into(),
        };
        registry.validate(&id, Some(&field("name")), &delta).unwrap();
    }

    #[test]
    fn accepts_null_for_any_kind() {
        let (registry, id) = registry();
        let delta = Delta::Lww {
            value: ScalarValue::Null,
        };
        registry.validate(&id, Some(&field("age")), &delta).unwrap();
    }

    #[test]
    fn rejects_wrong_kind() {
        let (registry, id) = registry();
        let delta = Delta::Lww { value: 7i64.into() };
        let err = registry.validate(&id, Some(&field("name")), &delta).unwrap_err();
        assert!(matches!(err, CrdtError::IncompatibleDelta(_)));
    }

    #[test]
    fn rejects_unknown_version_and_field() {
        let (registry, id) = registry();
        let delta = Delta::Lww {
            value: "x".into(),
        };
        let other = SchemaVersionId::new("users-v2").unwrap();
        assert!(registry.validate(&other, Some(&field("name")), &delta).is_err());
        assert!(registry.validate(&id, Some(&field("email")), &delta).is_err());
    }

    #[test]
    fn get_returns_registered_version() {
        let (registry, id) = registry();
        let schema = registry.get(&id).unwrap();
        assert_eq!(schema.kind_of(&field("age")), Some(FieldKind::Int));
        assert_eq!(schema.kind_of(&field("missing")), None);
    }
}
