use std::time::Duration;

use tessera_clock::MergeOutcome;
use tessera_store::{HeadKey, RetryPolicy};
use tessera_types::PeerId;

/// Limits and timeouts applied by a [`Replicator`](crate::Replicator).
#[derive(Clone, Debug)]
pub struct ReplicatorOptions {
    /// Retry policy for the write transaction that applies a received batch.
    pub retry: RetryPolicy,
    /// Bound on every request to a peer.
    pub request_timeout: Duration,
    /// Most blocks served in one `GetLog` or `GetDocGraph` response.
    pub max_log_blocks: usize,
    /// Most `GetLog` round-trips spent backfilling one received batch.
    pub max_fetch_rounds: usize,
}

impl Default for ReplicatorOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(5),
            max_log_blocks: 1024,
            max_fetch_rounds: 64,
        }
    }
}

/// What applying a batch of received commits changed locally.
#[derive(Clone, Debug, Default)]
pub struct IngestReport {
    /// Blocks written that were not stored before.
    pub stored: usize,
    /// `GetLog` round-trips spent fetching ancestors.
    pub fetch_rounds: usize,
    /// Head-set merges, one per key touched by the batch.
    pub merges: Vec<(HeadKey, MergeOutcome)>,
}

impl IngestReport {
    /// Whether any head set changed.
    pub fn changed(&self) -> bool {
        self.merges.iter().any(|(_, outcome)| outcome.changed())
    }
}

/// Outcome of pushing one commit to every subscribed peer.
#[derive(Clone, Debug, Default)]
pub struct FanOutReport {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<(PeerId, String)>,
}
