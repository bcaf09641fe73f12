//! The [`Node`] facade: document reads and writes, history queries and
//! replication with peers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessera_clock::MerkleClock;
use tessera_crdt::{CommitBlock, LwwRegister, ScalarValue, SchemaRegistry, SchemaVersion};
use tessera_events::{EventBus, EventFilter, EventStream};
use tessera_store::{retry_on_conflict, HeadKey, MemoryStore, RetryPolicy, Transaction};
use tessera_sync::{
    IngestReport, MemoryNetwork, MessageHandler, PeerTransport, Replicator, SessionTable,
};
use tessera_types::{Cid, DocKey, FieldId, PeerId, SchemaVersionId};

use crate::config::NodeConfig;
use crate::error::NodeResult;

/// One Tessera node: a store, its Merkle clock, an update bus and a
/// replicator, behind a document-oriented API.
///
/// Every write runs in its own transaction and is retried on conflict
/// according to the configured policy.
pub struct Node {
    id: PeerId,
    config: NodeConfig,
    store: Arc<MemoryStore>,
    events: Arc<EventBus>,
    clock: Arc<MerkleClock>,
    replicator: Arc<Replicator>,
    retry: RetryPolicy,
    push_loop: Option<JoinHandle<()>>,
}

impl Node {
    /// Start a node reachable on `network`.
    ///
    /// With pubsub enabled the node pushes its commits from a background
    /// task, so it must be started inside a Tokio runtime.
    pub fn new(mut config: NodeConfig, schemas: Arc<SchemaRegistry>, network: &Arc<MemoryNetwork>) -> Self {
        let id = node_id(&config);
        config.peer_id = Some(id.as_str().to_string());
        let transport = Arc::new(network.transport(id));
        let node = Self::with_transport(config, schemas, transport);
        let handler: Arc<dyn MessageHandler> = node.replicator.clone();
        network.register(node.id.clone(), Arc::downgrade(&handler));
        node
    }

    /// Start a node sending through `transport`. Routing peer requests to
    /// [`Node::replicator`] is left to the caller.
    pub fn with_transport(
        mut config: NodeConfig,
        schemas: Arc<SchemaRegistry>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let id = node_id(&config);
        config.peer_id = Some(id.as_str().to_string());
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(config.event_channel_capacity));
        let clock = Arc::new(MerkleClock::new(schemas).with_events(Arc::clone(&events)));
        let replicator = Arc::new(Replicator::new(
            id.clone(),
            store.clone(),
            Arc::clone(&clock),
            Arc::new(SessionTable::new()),
            transport,
            config.replicator_options(),
        ));

        let push_loop = if !config.enable_pubsub {
            None
        } else if tokio::runtime::Handle::try_current().is_ok() {
            Some(replicator.spawn_push_loop(events.subscribe(EventFilter::default())))
        } else {
            warn!(peer = %id, "no tokio runtime; local commits will not be pushed");
            None
        };

        info!(
            peer = %id,
            pubsub = push_loop.is_some(),
            data_path = ?config.data_path,
            "node started"
        );
        Self {
            id,
            retry: config.retry_policy(),
            config,
            store,
            events,
            clock,
            replicator,
            push_loop,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<MerkleClock> {
        &self.clock
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Make a schema version available to local writes and to validation of
    /// received commits.
    pub fn register_schema(&self, version: SchemaVersion) -> NodeResult<()> {
        Ok(self.clock.schemas().register(version)?)
    }

    // ---- Writes ----

    /// Set one field. Returns the new commit, which is the field's only head.
    pub async fn set_field(
        &self,
        doc_key: &DocKey,
        field: &FieldId,
        value: impl Into<ScalarValue>,
        schema_version: &SchemaVersionId,
    ) -> NodeResult<CommitBlock> {
        let key = HeadKey::field(doc_key.clone(), field.clone());
        let value = value.into();
        retry_on_conflict(&self.retry, |attempt| -> NodeResult<CommitBlock> {
            let mut txn = Transaction::begin(self.store.as_ref(), false)?;
            let block = self.clock.add_delta(
                &mut txn,
                &key,
                LwwRegister::delta(value.clone()),
                schema_version,
            )?;
            txn.commit()?;
            debug!(%key, attempt, cid = %block.cid().short_hex(), "field set");
            Ok(block)
        })
        .await
    }

    /// Apply several field writes and one document-level commit over the
    /// resulting heads, atomically. Returns the document-level commit.
    pub async fn update_document<I>(
        &self,
        doc_key: &DocKey,
        changes: I,
        schema_version: &SchemaVersionId,
    ) -> NodeResult<CommitBlock>
    where
        I: IntoIterator<Item = (FieldId, ScalarValue)>,
    {
        let changes: Vec<(FieldId, ScalarValue)> = changes.into_iter().collect();
        retry_on_conflict(&self.retry, |_| -> NodeResult<CommitBlock> {
            let mut txn = Transaction::begin(self.store.as_ref(), false)?;
            for (field, value) in &changes {
                self.clock.add_delta(
                    &mut txn,
                    &HeadKey::field(doc_key.clone(), field.clone()),
                    LwwRegister::delta(value.clone()),
                    schema_version,
                )?;
            }
            let block = self.clock.compose(&mut txn, doc_key, schema_version)?;
            txn.commit()?;
            Ok(block)
        })
        .await
    }

    // ---- Reads ----

    pub fn get_field(&self, doc_key: &DocKey, field: &FieldId) -> NodeResult<Option<ScalarValue>> {
        let mut txn = self.read_txn()?;
        let key = HeadKey::field(doc_key.clone(), field.clone());
        Ok(self.clock.resolve_field(&mut txn, &key)?)
    }

    /// Every field of the document with a visible value.
    pub fn get_document(&self, doc_key: &DocKey) -> NodeResult<BTreeMap<FieldId, ScalarValue>> {
        let mut txn = self.read_txn()?;
        Ok(self.clock.resolve_document(&mut txn, doc_key)?)
    }

    /// Heads of one key with their priorities, ordered by CID.
    pub fn heads(&self, key: &HeadKey) -> NodeResult<Vec<(Cid, u64)>> {
        let mut txn = self.read_txn()?;
        Ok(txn.heads().get(key)?)
    }

    /// Full history of a field (or of the document-level DAG when `field`
    /// is `None`), most recent commit first.
    pub fn commits(&self, doc_key: &DocKey, field: Option<&FieldId>) -> NodeResult<Vec<CommitBlock>> {
        let mut txn = self.read_txn()?;
        let key = head_key(doc_key, field);
        let walk = self.clock.history(&mut txn, &key)?;
        Ok(walk.collect::<Result<Vec<_>, _>>()?)
    }

    /// The current head commits of a field or of the document-level DAG.
    pub fn latest_commits(&self, doc_key: &DocKey, field: Option<&FieldId>) -> NodeResult<Vec<CommitBlock>> {
        let mut txn = self.read_txn()?;
        Ok(self.clock.get_heads(&mut txn, &head_key(doc_key, field))?)
    }

    /// Human-readable listing of every head set, for diagnostics.
    pub fn dump(&self) -> NodeResult<String> {
        let mut txn = self.read_txn()?;
        let heads = txn.heads().list_all()?;
        let mut out = format!("node {} ({} heads)\n", self.id, heads.len());
        let mut current: Option<&HeadKey> = None;
        for (key, cid, priority) in &heads {
            if current != Some(key) {
                out.push_str(&format!("{key}\n"));
                current = Some(key);
            }
            out.push_str(&format!("  {} priority={priority}\n", cid.short_hex()));
        }
        Ok(out)
    }

    /// Receive this node's committed updates matching `filter`.
    pub fn subscribe_events(&self, filter: EventFilter) -> EventStream {
        self.events.subscribe(filter)
    }

    // ---- Peers ----

    pub fn connect(&self, peer: &PeerId) {
        self.replicator.sessions().connect(peer.clone());
    }

    pub fn disconnect(&self, peer: &PeerId) {
        self.replicator.sessions().disconnect(peer);
    }

    /// Push future commits on `doc_key` to `peer`.
    pub fn subscribe(&self, peer: &PeerId, doc_key: &DocKey) {
        self.replicator
            .sessions()
            .subscribe(peer.clone(), doc_key.clone());
    }

    pub fn unsubscribe(&self, peer: &PeerId, doc_key: &DocKey) {
        self.replicator.sessions().unsubscribe(peer, doc_key);
    }

    /// Push one local commit to `peer`, returning the peer's heads for its
    /// key afterwards.
    pub async fn push(&self, peer: &PeerId, block: &CommitBlock) -> NodeResult<Vec<Cid>> {
        Ok(self.replicator.push_block(peer, block).await?)
    }

    /// Catch up on `doc_key` from `peer`'s current heads.
    pub async fn pull(&self, peer: &PeerId, doc_key: &DocKey) -> NodeResult<IngestReport> {
        Ok(self.replicator.pull_document(peer, doc_key).await?)
    }

    /// Fetch `peer`'s whole graph for `doc_key` below what is known locally.
    pub async fn fetch_document(&self, peer: &PeerId, doc_key: &DocKey) -> NodeResult<IngestReport> {
        Ok(self.replicator.fetch_document_graph(peer, doc_key).await?)
    }

    fn read_txn(&self) -> NodeResult<Transaction> {
        Ok(Transaction::begin(self.store.as_ref(), true)?)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(task) = self.push_loop.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("store", &self.store)
            .field("pubsub", &self.push_loop.is_some())
            .finish()
    }
}

fn node_id(config: &NodeConfig) -> PeerId {
    config
        .peer_id
        .as_deref()
        .map_or_else(PeerId::ephemeral, PeerId::new)
}

fn head_key(doc_key: &DocKey, field: Option<&FieldId>) -> HeadKey {
    match field {
        Some(field) => HeadKey::field(doc_key.clone(), field.clone()),
        None => HeadKey::composite(doc_key.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_crdt::FieldKind;

    fn doc() -> DocKey {
        DocKey::new("doc1").unwrap()
    }

    fn field(name: &str) -> FieldId {
        FieldId::new(name).unwrap()
    }

    fn v1() -> SchemaVersionId {
        SchemaVersionId::new("users-v1").unwrap()
    }

    fn node(network: &Arc<MemoryNetwork>, name: &str) -> Node {
        let schemas = Arc::new(SchemaRegistry::new());
        let node = Node::new(NodeConfig::default().with_peer_id(name), schemas, network);
        node.register_schema(
            SchemaVersion::new(v1())
                .with_field(field("name"), FieldKind::String)
                .with_field(field("age"), FieldKind::Int),
        )
        .unwrap();
        node
    }

    // ---- Writes and reads ----

    #[tokio::test]
    async fn set_and_get_field() {
        let n = node(&MemoryNetwork::new(), "a");
        assert_eq!(n.get_field(&doc(), &field("name")).unwrap(), None);
        let block = n.set_field(&doc(), &field("name"), "Alice", &v1()).await.unwrap();
        assert!(block.is_root());
        assert_eq!(
            n.get_field(&doc(), &field("name")).unwrap(),
            Some(ScalarValue::from("Alice"))
        );
    }

    #[tokio::test]
    async fn rejected_write_leaves_no_trace() {
        let n = node(&MemoryNetwork::new(), "a");
        let err = n.set_field(&doc(), &field("age"), "old", &v1()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::NodeError::Clock(tessera_clock::ClockError::Crdt(_))
        ));
        assert!(n.store().is_empty());
    }

    #[tokio::test]
    async fn update_document_commits_fields_and_composite_together() {
        let n = node(&MemoryNetwork::new(), "a");
        let composite = n
            .update_document(
                &doc(),
                [
                    (field("name"), ScalarValue::from("Alice")),
                    (field("age"), ScalarValue::from(30i64)),
                ],
                &v1(),
            )
            .await
            .unwrap();
        assert!(composite.is_composite());
        assert!(composite.is_root());
        assert_eq!(composite.references().len(), 2);

        let document = n.get_document(&doc()).unwrap();
        assert_eq!(document.len(), 2);
        assert_eq!(document[&field("age")], ScalarValue::from(30i64));
        assert_eq!(
            n.latest_commits(&doc(), None).unwrap()[0].cid(),
            composite.cid()
        );
    }

    #[tokio::test]
    async fn commits_walk_most_recent_first() {
        let n = node(&MemoryNetwork::new(), "a");
        for name in ["a", "b", "c"] {
            n.set_field(&doc(), &field("name"), name, &v1()).await.unwrap();
        }
        let history = n.commits(&doc(), Some(&field("name"))).unwrap();
        let priorities: Vec<u64> = history.iter().map(|b| b.priority()).collect();
        assert_eq!(priorities, vec![2, 1, 0]);
        assert_eq!(n.latest_commits(&doc(), Some(&field("name"))).unwrap().len(), 1);
        assert!(n.commits(&doc(), None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn dump_lists_every_head() {
        let n = node(&MemoryNetwork::new(), "a");
        let name = n.set_field(&doc(), &field("name"), "Alice", &v1()).await.unwrap();
        n.set_field(&DocKey::new("doc2").unwrap(), &field("age"), 7i64, &v1())
            .await
            .unwrap();

        let dump = n.dump().unwrap();
        assert!(dump.starts_with("node a (2 heads)"));
        assert!(dump.contains("doc1/name"));
        assert!(dump.contains("doc2/age"));
        assert!(dump.contains(&format!("{} priority=0", name.cid().short_hex())));
    }

    // ---- Events ----

    #[tokio::test]
    async fn events_follow_commits() {
        let n = node(&MemoryNetwork::new(), "a");
        let mut events = n.subscribe_events(EventFilter::document(doc()));
        let block = n.set_field(&doc(), &field("name"), "Alice", &v1()).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.cid, block.cid());
        assert_eq!(event.block, block.bytes());
    }

    #[test]
    fn starts_without_runtime() {
        let n = Node::new(
            NodeConfig::default(),
            Arc::new(SchemaRegistry::new()),
            &MemoryNetwork::new(),
        );
        assert!(n.push_loop.is_none());
        assert_eq!(n.config().peer_id.as_deref(), Some(n.id().as_str()));
    }

    #[test]
    fn custom_transport_records_generated_id() {
        let network = MemoryNetwork::new();
        let transport = Arc::new(network.transport(PeerId::new("relay")));
        let n = Node::with_transport(NodeConfig::default(), Arc::new(SchemaRegistry::new()), transport);
        assert_eq!(n.config().peer_id.as_deref(), Some(n.id().as_str()));
        assert_eq!(n.replicator().local(), n.id());
    }
}
