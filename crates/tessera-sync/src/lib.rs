//! Replication between Tessera peers.
//!
//! Peers exchange commit blocks verbatim and never re-create commits on
//! behalf of each other: every received block is verified against its CID,
//! its schema and its parents' priorities, its missing ancestors are
//! backfilled from the sender, and only then is the complete batch persisted
//! and folded into the local head sets with
//! [`MerkleClock::merge_heads`](tessera_clock::MerkleClock::merge_heads).
//!
//! The [`Replicator`] serves the five peer operations (`GetHeadLog`,
//! `GetLog`, `PushLog`, `GetDocGraph`, `PushDocGraph`) and drives push
//! fan-out of local commits to subscribed peers. Transports plug in through
//! [`PeerTransport`]; [`MemoryNetwork`] connects replicators in one process.

pub mod error;
pub mod replicator;
pub mod session;
pub mod transport;
pub mod types;

pub use error::{SyncError, SyncResult};
pub use replicator::Replicator;
pub use session::{PeerSyncState, SessionTable};
pub use transport::{MemoryNetwork, MemoryTransport, MessageHandler, PeerTransport};
pub use types::{FanOutReport, IngestReport, ReplicatorOptions};
