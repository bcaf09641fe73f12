//! Content addressing for Tessera.
//!
//! Provides domain-separated BLAKE3 hashing that turns canonical block bytes
//! into a [`Cid`](tessera_types::Cid). Wraps an established library; no
//! custom cryptography.

pub mod addresser;

pub use addresser::ContentAddresser;
