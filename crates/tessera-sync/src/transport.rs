use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tracing::debug;

use tessera_protocol::{SyncCodec, SyncMessage};
use tessera_types::PeerId;

use crate::error::{SyncError, SyncResult};

/// Request/response channel to remote peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send `msg` to `peer` and wait for its reply. Error replies are
    /// returned as messages; only delivery failures are errors.
    async fn request(&self, peer: &PeerId, msg: SyncMessage) -> SyncResult<SyncMessage>;
}

/// Serves requests arriving from peers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, from: &PeerId, msg: SyncMessage) -> SyncMessage;
}

/// In-process network connecting handlers by peer id, for tests and
/// embedding. Every message crosses the wire codec in both directions.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<PeerId, Weak<dyn MessageHandler>>>,
    offline: RwLock<HashSet<PeerId>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `handler` reachable as `peer`. The network does not keep the
    /// handler alive.
    pub fn register(&self, peer: PeerId, handler: Weak<dyn MessageHandler>) {
        self.endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer, handler);
    }

    /// A transport sending from `local` over this network.
    pub fn transport(self: &Arc<Self>, local: PeerId) -> MemoryTransport {
        MemoryTransport {
            local,
            network: Arc::clone(self),
        }
    }

    /// Cut `peer` off from (or reconnect it to) every other peer.
    pub fn set_online(&self, peer: &PeerId, online: bool) {
        let mut offline = self.offline.write().unwrap_or_else(|e| e.into_inner());
        if online {
            offline.remove(peer);
        } else {
            offline.insert(peer.clone());
        }
    }

    pub fn is_online(&self, peer: &PeerId) -> bool {
        !self
            .offline
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(peer)
    }

    fn handler(&self, peer: &PeerId) -> Option<Arc<dyn MessageHandler>> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let endpoints = self.endpoints.read().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("MemoryNetwork")
            .field("endpoints", &endpoints)
            .finish()
    }
}

/// One peer's view of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn request(&self, peer: &PeerId, msg: SyncMessage) -> SyncResult<SyncMessage> {
        if !self.network.is_online(&self.local) || !self.network.is_online(peer) {
            return Err(SyncError::Unreachable(peer.clone()));
        }
        let handler = self
            .network
            .handler(peer)
            .ok_or_else(|| SyncError::Unreachable(peer.clone()))?;

        let frame = SyncCodec::encode(&msg)?;
        debug!(from = %self.local, to = %peer, kind = msg.type_name(), bytes = frame.len(), "request");
        let (request, _) = SyncCodec::decode(&frame)?;
        let response = handler.handle(&self.local, request).await;
        let (response, _) = SyncCodec::decode(&SyncCodec::encode(&response)?)?;
        Ok(response)
    }
}
