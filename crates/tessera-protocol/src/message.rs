use serde::{Deserialize, Serialize};
use tessera_types::{Cid, DocKey, FieldId, PeerId, SchemaVersionId};

pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Status codes carried by [`SyncMessage::Error`].
pub mod codes {
    /// Malformed request or block.
    pub const INVALID: u32 = 400;
    pub const NOT_FOUND: u32 = 404;
    pub const CONFLICT: u32 = 409;
    pub const INCOMPATIBLE_DELTA: u32 = 422;
    pub const MISSING_ANCESTORS: u32 = 424;
    pub const INTERNAL: u32 = 500;
}

/// A commit block as it travels between peers: the claimed CID and the
/// verbatim block bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEnvelope {
    pub cid: Cid,
    pub data: Vec<u8>,
}

/// Body of an unsolicited commit delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushBody {
    pub doc_key: DocKey,
    /// `None` for a document-level commit.
    pub field: Option<FieldId>,
    pub cid: Cid,
    pub schema_version: SchemaVersionId,
    pub creator: PeerId,
    pub block: Vec<u8>,
}

/// All message types of the replication protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    GetDocGraphRequest {
        doc_key: DocKey,
        known: Vec<Cid>,
        limit: Option<u32>,
    },
    GetDocGraphResponse {
        heads: Vec<Cid>,
        blocks: Vec<BlockEnvelope>,
        continuation: Vec<Cid>,
    },
    PushDocGraphRequest(PushBody),
    PushLogRequest(PushBody),
    PushAck {
        doc_key: DocKey,
        heads: Vec<Cid>,
    },
    GetLogRequest {
        doc_key: DocKey,
        field: Option<FieldId>,
        head: Cid,
        known: Vec<Cid>,
        limit: Option<u32>,
    },
    GetLogResponse {
        blocks: Vec<BlockEnvelope>,
        continuation: Vec<Cid>,
    },
    GetHeadLogRequest {
        doc_key: DocKey,
    },
    GetHeadLogResponse {
        heads: Vec<BlockEnvelope>,
    },
    Error {
        code: u32,
        message: String,
    },
}

impl SyncMessage {
    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn type_tag(&self) -> u8 {
        match self {
            Self::GetDocGraphRequest { .. } => 1,
            Self::GetDocGraphResponse { .. } => 2,
            Self::PushDocGraphRequest(_) => 3,
            Self::PushLogRequest(_) => 4,
            Self::PushAck { .. } => 5,
            Self::GetLogRequest { .. } => 6,
            Self::GetLogResponse { .. } => 7,
            Self::GetHeadLogRequest { .. } => 8,
            Self::GetHeadLogResponse { .. } => 9,
            Self::Error { .. } => 255,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::GetDocGraphRequest { .. } => "GetDocGraphRequest",
            Self::GetDocGraphResponse { .. } => "GetDocGraphResponse",
            Self::PushDocGraphRequest(_) => "PushDocGraphRequest",
            Self::PushLogRequest(_) => "PushLogRequest",
            Self::PushAck { .. } => "PushAck",
            Self::GetLogRequest { .. } => "GetLogRequest",
            Self::GetLogResponse { .. } => "GetLogResponse",
            Self::GetHeadLogRequest { .. } => "GetHeadLogRequest",
            Self::GetHeadLogResponse { .. } => "GetHeadLogResponse",
            Self::Error { .. } => "Error",
        }
    }
}
