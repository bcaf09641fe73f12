use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_types::{Cid, FieldId};

/// Declared kind of a scalar field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    String,
    Bytes,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// A scalar field value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl ScalarValue {
    /// The kind of this value, or `None` for [`ScalarValue::Null`].
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(FieldKind::Bool),
            Self::Int(_) => Some(FieldKind::Int),
            Self::Float(_) => Some(FieldKind::Float),
            Self::String(_) => Some(FieldKind::String),
            Self::Bytes(_) => Some(FieldKind::Bytes),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => write!(f, "0x{}", v.iter().map(|b| format!("{b:02x}")).collect::<String>()),
        }
    }
}

/// The CRDT operation carried by a commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    /// New value of a last-writer-wins scalar field.
    Lww { value: ScalarValue },
    /// Document-level commit: each field's sub-DAG head at composition time.
    Composite { fields: BTreeMap<FieldId, Cid> },
}

impl Delta {
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite { .. })
    }

    /// Short name of the variant, for logs and error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Lww { .. } => "lww",
            Self::Composite { .. } => "composite",
        }
    }

    /// CIDs this delta refers to outside of the commit's own links.
    pub fn references(&self) -> impl Iterator<Item = &Cid> {
        let fields = match self {
            Self::Composite { fields } => Some(fields.values()),
            Self::Lww { .. } => None,
        };
        fields.into_iter().flatten()
    }
}
