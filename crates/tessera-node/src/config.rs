use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_store::RetryPolicy;
use tessera_sync::ReplicatorOptions;

use crate::error::NodeResult;

/// Node options. Every field has a default, so a TOML file only needs the
/// keys it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity announced to peers. A random id is used when unset.
    pub peer_id: Option<String>,
    /// Attempts for a transaction that loses a write conflict, including
    /// the first.
    pub max_txn_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// Bound on every request to a peer.
    pub request_timeout_ms: u64,
    /// Most blocks served per `GetLog` or `GetDocGraph` response.
    pub max_log_blocks: usize,
    /// Most `GetLog` round-trips spent backfilling one received push.
    pub max_fetch_rounds: usize,
    pub event_channel_capacity: usize,
    /// Where a persistent backend would keep its files. The in-memory store
    /// ignores it.
    pub data_path: Option<PathBuf>,
    /// Push local commits to subscribed peers.
    pub enable_pubsub: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            max_txn_retries: 5,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 2000,
            request_timeout_ms: 5000,
            max_log_blocks: 1024,
            max_fetch_rounds: 64,
            event_channel_capacity: 1024,
            data_path: None,
            enable_pubsub: true,
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(s: &str) -> NodeResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> NodeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn with_max_txn_retries(mut self, retries: u32) -> Self {
        self.max_txn_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_ms = base.as_millis() as u64;
        self.retry_backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_fetch_rounds(mut self, rounds: usize) -> Self {
        self.max_fetch_rounds = rounds;
        self
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn with_pubsub(mut self, enabled: bool) -> Self {
        self.enable_pubsub = enabled;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_txn_retries,
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_backoff_max_ms),
        }
    }

    pub fn replicator_options(&self) -> ReplicatorOptions {
        ReplicatorOptions {
            retry: self.retry_policy(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_log_blocks: self.max_log_blocks,
            max_fetch_rounds: self.max_fetch_rounds,
        }
    }
}
