//! MerkleCRDT commit blocks and registers for Tessera.
//!
//! A [`CommitBlock`] is the immutable unit of versioned state. Registers
//! define, per field kind, what a commit's [`Delta`] carries and how a set of
//! concurrent heads resolves to the value readers see:
//!
//! - [`LwwRegister`] -- last-writer-wins scalar: highest priority wins, ties
//!   go to the greatest CID
//! - [`CompositeRegister`] -- document-level commits mapping each field to
//!   the head of its own sub-DAG
//!
//! Deltas are validated against the [`SchemaVersion`] recorded on the
//! commit before they are accepted.

pub mod block;
pub mod composite;
pub mod delta;
pub mod error;
pub mod lww;
pub mod schema;

pub use block::CommitBlock;
pub use composite::CompositeRegister;
pub use delta::{Delta, FieldKind, ScalarValue};
pub use error::{CrdtError, CrdtResult};
pub use lww::LwwRegister;
pub use schema::{SchemaRegistry, SchemaVersion};
