//! Foundation types for Tessera.
//!
//! Tessera versions every document field as a Merkle DAG of immutable,
//! content-addressed commits. This crate provides the identifiers shared by
//! every other Tessera crate.
//!
//! # Key Types
//!
//! - [`Cid`] -- Content identifier: a BLAKE3 digest wrapped with a codec tag
//! - [`DocKey`] -- Stable identifier of a document
//! - [`FieldId`] -- Identifier of a field within a document
//! - [`SchemaVersionId`] -- Schema version in effect when a commit was made
//! - [`PeerId`] -- Identity of a replicating node

pub mod cid;
pub mod error;
pub mod keys;

pub use cid::Cid;
pub use error::TypeError;
pub use keys::{DocKey, FieldId, PeerId, SchemaVersionId};
