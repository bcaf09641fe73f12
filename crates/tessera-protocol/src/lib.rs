//! Wire protocol for Tessera replication.
//!
//! Defines the request/response messages exchanged between peers for the
//! five replication operations (`GetDocGraph`, `PushDocGraph`, `GetLog`,
//! `PushLog`, `GetHeadLog`) and the framing used to put them on the wire.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::SyncCodec;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{codes, BlockEnvelope, PushBody, SyncMessage, MAX_MESSAGE_SIZE};
