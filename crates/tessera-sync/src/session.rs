use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use tracing::info;

use tessera_types::{DocKey, PeerId};

/// What a node knows about one remote peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerSyncState {
    pub connected: bool,
    /// Documents the peer wants pushed to it.
    pub subscriptions: BTreeSet<DocKey>,
}

/// Per-node table of peer sessions and document subscriptions.
///
/// Each node owns its own table, so several nodes can share a process.
#[derive(Debug, Default)]
pub struct SessionTable {
    peers: RwLock<HashMap<PeerId, PeerSyncState>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, peer: PeerId) {
        info!(%peer, "peer connected");
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(peer)
            .or_default()
            .connected = true;
    }

    /// Mark a peer disconnected. Its subscriptions are kept for when it
    /// reconnects.
    pub fn disconnect(&self, peer: &PeerId) {
        if let Some(state) = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(peer)
        {
            info!(%peer, "peer disconnected");
            state.connected = false;
        }
    }

    pub fn subscribe(&self, peer: PeerId, doc_key: DocKey) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(peer)
            .or_default()
            .subscriptions
            .insert(doc_key);
    }

    pub fn unsubscribe(&self, peer: &PeerId, doc_key: &DocKey) {
        if let Some(state) = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(peer)
        {
            state.subscriptions.remove(doc_key);
        }
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.state(peer).is_some_and(|s| s.connected)
    }

    pub fn state(&self, peer: &PeerId) -> Option<PeerSyncState> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
    }

    /// Connected peers subscribed to `doc_key`, in a stable order.
    pub fn subscribers_of(&self, doc_key: &DocKey) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, s)| s.connected && s.subscriptions.contains(doc_key))
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, s)| s.connected)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str) -> DocKey {
        DocKey::new(name).unwrap()
    }

    #[test]
    fn only_connected_subscribers_receive_pushes() {
        let table = SessionTable::new();
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        table.connect(a.clone());
        table.subscribe(a.clone(), doc("doc1"));
        table.subscribe(b.clone(), doc("doc1"));

        assert_eq!(table.subscribers_of(&doc("doc1")), vec![a.clone()]);
        table.connect(b.clone());
        assert_eq!(table.subscribers_of(&doc("doc1")), vec![a.clone(), b.clone()]);
        assert!(table.subscribers_of(&doc("doc2")).is_empty());
    }

    #[test]
    fn disconnect_keeps_subscriptions() {
        let table = SessionTable::new();
        let a = PeerId::new("a");
        table.connect(a.clone());
        table.subscribe(a.clone(), doc("doc1"));
        table.disconnect(&a);

        assert!(!table.is_connected(&a));
        assert!(table.subscribers_of(&doc("doc1")).is_empty());
        assert!(table.state(&a).unwrap().subscriptions.contains(&doc("doc1")));

        table.connect(a.clone());
        assert_eq!(table.subscribers_of(&doc("doc1")), vec![a]);
    }

    #[test]
    fn unsubscribe_and_unknown_peers() {
        let table = SessionTable::new();
        let a = PeerId::new("a");
        table.disconnect(&a);
        assert!(table.state(&a).is_none());

        table.connect(a.clone());
        table.subscribe(a.clone(), doc("doc1"));
        table.unsubscribe(&a, &doc("doc1"));
        assert!(table.subscribers_of(&doc("doc1")).is_empty());
        assert_eq!(table.connected_peers(), vec![a]);
    }
}
