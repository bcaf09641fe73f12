use serde::{Deserialize, Serialize};
use tessera_types::{Cid, DocKey, FieldId, SchemaVersionId};

/// A commit that was durably applied by a local write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub doc_key: DocKey,
    /// `None` for a document-level (composite) commit.
    pub field: Option<FieldId>,
    pub cid: Cid,
    pub priority: u64,
    pub schema_version: SchemaVersionId,
    /// Canonical block bytes, ready to be pushed verbatim.
    pub block: Vec<u8>,
}

impl UpdateEvent {
    pub fn is_composite(&self) -> bool {
        self.field.is_none()
    }
}
