//! Merkle clock for Tessera.
//!
//! The clock turns deltas into linked [`CommitBlock`](tessera_crdt::CommitBlock)s
//! and maintains the head set of every `(document, field)` key:
//!
//! - [`MerkleClock::add_delta`] -- append a local commit on top of the
//!   current heads
//! - [`MerkleClock::merge_heads`] -- fold received commits into the head
//!   set, keeping it an antichain of the known DAG
//! - [`MerkleClock::get_heads`] -- the current head commits
//!
//! [`DagWalk`] and [`collect_log`] traverse stored commits for history
//! queries and replication.
//!
//! # Invariants
//!
//! - A head set never contains two commits where one is an ancestor of the
//!   other.
//! - Every link of a head resolves to a stored block.
//! - A commit's priority is strictly greater than each of its parents'.

pub mod clock;
pub mod error;
pub mod walk;

pub use clock::{update_event, MergeOutcome, MerkleClock};
pub use error::{ClockError, ClockResult};
pub use walk::{collect_log, BlockReader, DagWalk, LogBatch};
