//! Transactional storage for Tessera.
//!
//! The storage engine itself is a collaborator consumed through the
//! [`TxnStore`] / [`KvTxn`] contract. On top of it this crate provides:
//!
//! - [`Transaction`] -- a terminal-once wrapper with ordered success and
//!   error hook lists
//! - [`BlockStore`] -- append-only, content-addressed commit block storage
//! - [`HeadStore`] -- the per-(document, field) set of head CIDs
//! - [`MemoryStore`] -- an in-memory backend with optimistic conflict
//!   detection, for tests and embedding
//! - [`retry_on_conflict`] -- bounded retry with backoff for conflicting
//!   transactions
//!
//! # Design Rules
//!
//! 1. Blocks are immutable once written; writing an existing CID is a no-op.
//! 2. Head sets are the only mutable shared state and are protected solely
//!    by transaction isolation.
//! 3. A transaction reaches exactly one terminal action; dropping a pending
//!    transaction discards it.

pub mod blocks;
pub mod error;
pub mod heads;
pub mod memory;
pub mod retry;
pub mod traits;
pub mod txn;

pub use blocks::BlockStore;
pub use error::{StoreError, StoreResult};
pub use heads::{HeadKey, HeadStore};
pub use memory::MemoryStore;
pub use retry::{retry_on_conflict, retry_on_conflict_async, RetryPolicy, Retryable};
pub use traits::{KvTxn, TxnStore};
pub use txn::{Transaction, TxnState};
