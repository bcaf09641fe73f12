use tessera_types::FieldId;

use crate::block::CommitBlock;
use crate::delta::{Delta, FieldKind, ScalarValue};
use crate::error::{CrdtError, CrdtResult};

/// Last-writer-wins register for scalar fields.
///
/// Among a set of candidate commits the one with the highest priority wins;
/// on equal priority the greatest CID (compared as bytes) wins. The winner
/// depends only on the set of candidates, never on the order they arrived
/// in, so peers holding the same commits resolve the same value.
pub struct LwwRegister;

impl LwwRegister {
    /// The delta that sets a field to `value`.
    pub fn delta(value: ScalarValue) -> Delta {
        Delta::Lww { value }
    }

    /// Check that `delta` can be stored in a field declared as `kind`.
    /// Null is accepted for every kind.
    pub fn validate(field: &FieldId, kind: FieldKind, delta: &Delta) -> CrdtResult<()> {
        match delta {
            Delta::Lww { value } => match value.kind() {
                None => Ok(()),
                Some(actual) if actual == kind => Ok(()),
                Some(actual) => Err(CrdtError::IncompatibleDelta(format!(
                    "field {field} is declared {kind}, got {actual}"
                ))),
            },
            other => Err(CrdtError::IncompatibleDelta(format!(
                "field {field} expects an lww delta, got {}",
                other.kind_name()
            ))),
        }
    }

    /// The winning commit among `candidates`, if any.
    pub fn winner<'a, I>(candidates: I) -> Option<&'a CommitBlock>
    where
        I: IntoIterator<Item = &'a CommitBlock>,
    {
        candidates
            .into_iter()
            .max_by(|a, b| (a.priority(), a.cid()).cmp(&(b.priority(), b.cid())))
    }

    /// The value readers see for a field whose heads are `candidates`.
    ///
    /// Returns `Ok(None)` when there are no candidates (the field was never
    /// written).
    pub fn resolve<'a, I>(candidates: I) -> CrdtResult<Option<ScalarValue>>
    where
        I: IntoIterator<Item = &'a CommitBlock>,
    {
        match Self::winner(candidates) {
            None => Ok(None),
            Some(block) => match block.delta() {
                Delta::Lww { value } => Ok(Some(value.clone())),
                other => Err(CrdtError::IncompatibleDelta(format!(
                    "commit {} carries a {} delta, not lww",
                    block.cid(),
                    other.kind_name()
                ))),
            },
        }
    }
}
