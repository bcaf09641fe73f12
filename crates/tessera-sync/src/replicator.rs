//! Replicator: serves peer sync requests and ingests received commits.
//!
//! Received batches are verified and backfilled before anything is written,
//! then applied in a single transaction retried on conflict.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use tessera_clock::{collect_log, BlockReader, ClockError, MerkleClock};
use tessera_crdt::{CommitBlock, CrdtError, Delta};
use tessera_events::{EventStream, UpdateEvent};
use tessera_protocol::{BlockEnvelope, PushBody, SyncMessage};
use tessera_store::{retry_on_conflict, HeadKey, Transaction, TxnStore};
use tessera_types::{Cid, DocKey, FieldId, PeerId};

use crate::error::{SyncError, SyncResult};
use crate::session::SessionTable;
use crate::transport::{MessageHandler, PeerTransport};
use crate::types::{FanOutReport, IngestReport, ReplicatorOptions};

/// Replication endpoint of one node.
///
/// Received commits go through three phases:
///
/// 1. **verify**: each block must decode under its claimed CID, belong to
///    the document being synced and fit its schema version;
/// 2. **backfill**: references that are neither stored nor part of the
///    batch are requested from the sending peer with `GetLog`, iteratively,
///    outside of any write transaction;
/// 3. **apply**: in one write transaction (retried on conflict) parent
///    priorities are checked, the blocks are stored verbatim and every
///    touched head set is merged.
///
/// Nothing is written unless all three phases succeed.
pub struct Replicator {
    local: PeerId,
    store: Arc<dyn TxnStore>,
    clock: Arc<MerkleClock>,
    sessions: Arc<SessionTable>,
    transport: Arc<dyn PeerTransport>,
    options: ReplicatorOptions,
}

impl Replicator {
    pub fn new(
        local: PeerId,
        store: Arc<dyn TxnStore>,
        clock: Arc<MerkleClock>,
        sessions: Arc<SessionTable>,
        transport: Arc<dyn PeerTransport>,
        options: ReplicatorOptions,
    ) -> Self {
        Self {
            local,
            store,
            clock,
            sessions,
            transport,
            options,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn options(&self) -> &ReplicatorOptions {
        &self.options
    }

    // ---------------------------------------------------------------
    // Serving peers
    // ---------------------------------------------------------------

    /// Answer one request from `from`. Failures are reported to the peer as
    /// an error message carrying the matching status code.
    pub async fn serve(&self, from: &PeerId, msg: SyncMessage) -> SyncMessage {
        let kind = msg.type_name();
        let result = match msg {
            SyncMessage::GetHeadLogRequest { doc_key } => self.serve_head_log(&doc_key),
            SyncMessage::GetLogRequest {
                doc_key,
                field,
                head,
                known,
                limit,
            } => self.serve_log(&doc_key, field.as_ref(), head, known, limit),
            SyncMessage::GetDocGraphRequest { doc_key, known, limit } => {
                self.serve_doc_graph(&doc_key, known, limit)
            }
            SyncMessage::PushLogRequest(body) => self.receive_push(from, body, false).await,
            SyncMessage::PushDocGraphRequest(body) => self.receive_push(from, body, true).await,
            other => Err(SyncError::UnexpectedMessage(other.type_name())),
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(peer = %from, kind, error = %e, "rejected peer request");
                SyncMessage::error(e.code(), e.to_string())
            }
        }
    }

    fn serve_head_log(&self, doc_key: &DocKey) -> SyncResult<SyncMessage> {
        let mut txn = Transaction::begin(self.store.as_ref(), true)?;
        let heads = txn.heads().list_document(doc_key)?;
        let mut reader = BlockReader::new(&mut txn);
        let heads = heads
            .iter()
            .map(|(_, cid, _)| reader.load(cid).map(|b| envelope(&b)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SyncMessage::GetHeadLogResponse { heads })
    }

    fn serve_log(
        &self,
        doc_key: &DocKey,
        field: Option<&FieldId>,
        head: Cid,
        known: Vec<Cid>,
        limit: Option<u32>,
    ) -> SyncResult<SyncMessage> {
        let mut txn = Transaction::begin(self.store.as_ref(), true)?;
        let block = BlockReader::new(&mut txn).load(&head)?;
        if block.doc_key() != doc_key {
            return Err(SyncError::InvalidRequest(format!(
                "commit {head} does not belong to document {doc_key}"
            )));
        }
        if let Some(field) = field {
            if block.field() != Some(field) {
                return Err(SyncError::InvalidRequest(format!(
                    "commit {head} does not belong to field {field}"
                )));
            }
        }
        let known: HashSet<Cid> = known.into_iter().collect();
        let batch = collect_log(&mut txn, &[head], &known, self.page_limit(limit))?;
        debug!(doc = %doc_key, head = %head.short_hex(), blocks = batch.blocks.len(), "served log");
        Ok(SyncMessage::GetLogResponse {
            blocks: batch.blocks.iter().map(envelope).collect(),
            continuation: batch.remaining,
        })
    }

    fn serve_doc_graph(&self, doc_key: &DocKey, known: Vec<Cid>, limit: Option<u32>) -> SyncResult<SyncMessage> {
        let mut txn = Transaction::begin(self.store.as_ref(), true)?;
        let heads: Vec<Cid> = txn
            .heads()
            .list_document(doc_key)?
            .into_iter()
            .map(|(_, cid, _)| cid)
            .collect();
        let known: HashSet<Cid> = known.into_iter().collect();
        let batch = collect_log(&mut txn, &heads, &known, self.page_limit(limit))?;
        Ok(SyncMessage::GetDocGraphResponse {
            heads,
            blocks: batch.blocks.iter().map(envelope).collect(),
            continuation: batch.remaining,
        })
    }

    async fn receive_push(&self, from: &PeerId, body: PushBody, document_level: bool) -> SyncResult<SyncMessage> {
        let block = CommitBlock::decode(&body.cid, &body.block)?;
        if block.field() != body.field.as_ref() || block.schema_version() != &body.schema_version {
            return Err(SyncError::InvalidRequest(format!(
                "push header does not match commit {}",
                body.cid
            )));
        }
        if document_level && !block.is_composite() {
            return Err(SyncError::InvalidRequest(format!(
                "commit {} is not a document-level commit",
                body.cid
            )));
        }
        debug!(peer = %from, creator = %body.creator, cid = %body.cid.short_hex(), "received push");

        let key = HeadKey {
            doc_key: body.doc_key.clone(),
            field: body.field,
        };
        self.ingest(from, &body.doc_key, vec![block], Vec::new()).await?;

        let mut txn = Transaction::begin(self.store.as_ref(), true)?;
        let heads = txn.heads().get(&key)?.into_iter().map(|(cid, _)| cid).collect();
        Ok(SyncMessage::PushAck {
            doc_key: body.doc_key,
            heads,
        })
    }

    fn page_limit(&self, requested: Option<u32>) -> usize {
        let max = self.options.max_log_blocks.max(1);
        requested.map_or(max, |n| (n as usize).clamp(1, max))
    }

    // ---------------------------------------------------------------
    // Requesting from peers
    // ---------------------------------------------------------------

    async fn request(&self, peer: &PeerId, msg: SyncMessage) -> SyncResult<SyncMessage> {
        let op = msg.type_name();
        let reply = tokio::time::timeout(self.options.request_timeout, self.transport.request(peer, msg))
            .await
            .map_err(|_| SyncError::Timeout {
                peer: peer.clone(),
                op,
            })??;
        match reply {
            SyncMessage::Error { code, message } => Err(SyncError::Remote { code, message }),
            reply => Ok(reply),
        }
    }

    /// Push a local commit to `peer`. Returns the peer's heads for the
    /// commit's key after it merged the commit.
    pub async fn push_block(&self, peer: &PeerId, block: &CommitBlock) -> SyncResult<Vec<Cid>> {
        let body = PushBody {
            doc_key: block.doc_key().clone(),
            field: block.field().cloned(),
            cid: block.cid(),
            schema_version: block.schema_version().clone(),
            creator: self.local.clone(),
            block: block.bytes().to_vec(),
        };
        let msg = if block.is_composite() {
            SyncMessage::PushDocGraphRequest(body)
        } else {
            SyncMessage::PushLogRequest(body)
        };
        match self.request(peer, msg).await? {
            SyncMessage::PushAck { heads, .. } => Ok(heads),
            other => Err(SyncError::UnexpectedMessage(other.type_name())),
        }
    }

    /// Catch up on `doc_key` from `peer`: fetch its current heads and
    /// backfill and merge whatever is not known locally.
    pub async fn pull_document(&self, peer: &PeerId, doc_key: &DocKey) -> SyncResult<IngestReport> {
        let msg = SyncMessage::GetHeadLogRequest {
            doc_key: doc_key.clone(),
        };
        let heads = match self.request(peer, msg).await? {
            SyncMessage::GetHeadLogResponse { heads } => heads,
            other => return Err(SyncError::UnexpectedMessage(other.type_name())),
        };
        let roots = decode_all(&heads)?;
        let report = self.ingest(peer, doc_key, roots, Vec::new()).await?;
        info!(%peer, doc = %doc_key, stored = report.stored, "pulled document");
        Ok(report)
    }

    /// Fetch the whole commit graph of `doc_key` from `peer`, skipping
    /// everything below the local heads.
    pub async fn fetch_document_graph(&self, peer: &PeerId, doc_key: &DocKey) -> SyncResult<IngestReport> {
        let msg = SyncMessage::GetDocGraphRequest {
            doc_key: doc_key.clone(),
            known: self.local_heads(doc_key)?,
            limit: None,
        };
        let (blocks, continuation) = match self.request(peer, msg).await? {
            SyncMessage::GetDocGraphResponse {
                blocks, continuation, ..
            } => (blocks, continuation),
            other => return Err(SyncError::UnexpectedMessage(other.type_name())),
        };
        let roots = decode_all(&blocks)?;
        self.ingest(peer, doc_key, roots, continuation).await
    }

    // ---------------------------------------------------------------
    // Ingest
    // ---------------------------------------------------------------

    /// Verify, backfill and apply commits received from `from`.
    ///
    /// `roots` are the received blocks, `pending` any further CIDs the peer
    /// announced without sending.
    pub async fn ingest(
        &self,
        from: &PeerId,
        doc_key: &DocKey,
        roots: Vec<CommitBlock>,
        mut pending: Vec<Cid>,
    ) -> SyncResult<IngestReport> {
        let mut batch: BTreeMap<Cid, CommitBlock> = BTreeMap::new();
        let stored = self.stored_among(roots.iter().map(|b| b.cid()))?;
        for root in roots {
            if stored.contains(&root.cid()) {
                continue;
            }
            self.admit(doc_key, &root)?;
            pending.extend(root.references());
            batch.insert(root.cid(), root);
        }
        let Some(&first) = batch.keys().next() else {
            return Ok(IngestReport::default());
        };

        let known = self.local_heads(doc_key)?;
        let mut rounds = 0;
        loop {
            pending.retain(|cid| !batch.contains_key(cid));
            pending.sort();
            pending.dedup();
            let stored = self.stored_among(pending.iter().copied())?;
            pending.retain(|cid| !stored.contains(cid));
            let Some(next) = pending.pop() else { break };

            if rounds >= self.options.max_fetch_rounds {
                pending.push(next);
                warn!(peer = %from, doc = %doc_key, rounds, "ancestor backfill exhausted");
                return Err(SyncError::MissingAncestors {
                    head: first,
                    missing: pending,
                });
            }
            rounds += 1;

            let (blocks, continuation) = self.fetch_log(from, doc_key, next, &known).await?;
            let stored = self.stored_among(blocks.iter().map(|b| b.cid()))?;
            for block in blocks {
                if batch.contains_key(&block.cid()) || stored.contains(&block.cid()) {
                    continue;
                }
                self.admit(doc_key, &block)?;
                pending.extend(block.references());
                batch.insert(block.cid(), block);
            }
            if !batch.contains_key(&next) {
                return Err(SyncError::MissingAncestors {
                    head: first,
                    missing: vec![next],
                });
            }
            pending.extend(continuation);
        }

        let mut report = retry_on_conflict(&self.options.retry, |_| self.apply(&batch)).await?;
        report.fetch_rounds = rounds;
        debug!(
            peer = %from,
            doc = %doc_key,
            blocks = batch.len(),
            stored = report.stored,
            rounds,
            "ingested commits"
        );
        Ok(report)
    }

    async fn fetch_log(
        &self,
        from: &PeerId,
        doc_key: &DocKey,
        head: Cid,
        known: &[Cid],
    ) -> SyncResult<(Vec<CommitBlock>, Vec<Cid>)> {
        let msg = SyncMessage::GetLogRequest {
            doc_key: doc_key.clone(),
            field: None,
            head,
            known: known.to_vec(),
            limit: None,
        };
        match self.request(from, msg).await {
            Ok(SyncMessage::GetLogResponse { blocks, continuation }) => Ok((decode_all(&blocks)?, continuation)),
            Ok(other) => Err(SyncError::UnexpectedMessage(other.type_name())),
            Err(e) => {
                warn!(peer = %from, cid = %head.short_hex(), error = %e, "ancestor fetch failed");
                Err(SyncError::MissingAncestors {
                    head,
                    missing: vec![head],
                })
            }
        }
    }

    /// Check that a received block belongs to `doc_key` and fits its schema.
    fn admit(&self, doc_key: &DocKey, block: &CommitBlock) -> SyncResult<()> {
        if block.doc_key() != doc_key {
            return Err(SyncError::InvalidRequest(format!(
                "commit {} belongs to {}, not {doc_key}",
                block.cid(),
                block.doc_key()
            )));
        }
        self.clock
            .schemas()
            .validate(block.schema_version(), block.field(), block.delta())?;
        Ok(())
    }

    /// Persist a complete batch and merge every touched head set, in one
    /// transaction.
    fn apply(&self, batch: &BTreeMap<Cid, CommitBlock>) -> SyncResult<IngestReport> {
        let mut txn = Transaction::begin(self.store.as_ref(), false)?;
        verify_parents(&mut txn, batch)?;

        let mut report = IngestReport::default();
        for block in batch.values() {
            if txn.blocks().put(&block.cid(), block.bytes())? {
                report.stored += 1;
            }
        }

        let linked: HashSet<Cid> = batch.values().flat_map(|b| b.links().iter().copied()).collect();
        let mut tips: BTreeMap<HeadKey, Vec<Cid>> = BTreeMap::new();
        for block in batch.values().filter(|b| !linked.contains(&b.cid())) {
            let key = HeadKey {
                doc_key: block.doc_key().clone(),
                field: block.field().cloned(),
            };
            tips.entry(key).or_default().push(block.cid());
        }
        for (key, incoming) in tips {
            let outcome = self.clock.merge_heads(&mut txn, &key, &incoming)?;
            report.merges.push((key, outcome));
        }
        txn.commit()?;
        Ok(report)
    }

    fn stored_among(&self, cids: impl IntoIterator<Item = Cid>) -> SyncResult<HashSet<Cid>> {
        let mut txn = Transaction::begin(self.store.as_ref(), true)?;
        let mut stored = HashSet::new();
        for cid in cids {
            if txn.blocks().has(&cid)? {
                stored.insert(cid);
            }
        }
        Ok(stored)
    }

    fn local_heads(&self, doc_key: &DocKey) -> SyncResult<Vec<Cid>> {
        let mut txn = Transaction::begin(self.store.as_ref(), true)?;
        let heads: BTreeSet<Cid> = txn
            .heads()
            .list_document(doc_key)?
            .into_iter()
            .map(|(_, cid, _)| cid)
            .collect();
        Ok(heads.into_iter().collect())
    }

    // ---------------------------------------------------------------
    // Push fan-out
    // ---------------------------------------------------------------

    /// Push one committed update to every connected peer subscribed to its
    /// document. A failing peer never affects the others.
    pub async fn fan_out(&self, event: &UpdateEvent) -> FanOutReport {
        let peers = self.sessions.subscribers_of(&event.doc_key);
        let body = PushBody {
            doc_key: event.doc_key.clone(),
            field: event.field.clone(),
            cid: event.cid,
            schema_version: event.schema_version.clone(),
            creator: self.local.clone(),
            block: event.block.clone(),
        };
        let msg = if event.is_composite() {
            SyncMessage::PushDocGraphRequest(body)
        } else {
            SyncMessage::PushLogRequest(body)
        };

        let mut set = JoinSet::new();
        for peer in peers {
            let transport = Arc::clone(&self.transport);
            let msg = msg.clone();
            let timeout = self.options.request_timeout;
            set.spawn(async move {
                let result = tokio::time::timeout(timeout, transport.request(&peer, msg)).await;
                (peer, result)
            });
        }

        let mut report = FanOutReport::default();
        while let Some(joined) = set.join_next().await {
            let (peer, failure) = match joined {
                Ok((peer, Ok(Ok(SyncMessage::PushAck { .. })))) => {
                    report.delivered.push(peer);
                    continue;
                }
                Ok((peer, Ok(Ok(SyncMessage::Error { code, message })))) => (peer, format!("{code}: {message}")),
                Ok((peer, Ok(Ok(other)))) => (peer, format!("unexpected {}", other.type_name())),
                Ok((peer, Ok(Err(e)))) => (peer, e.to_string()),
                Ok((peer, Err(_))) => (peer, "timed out".to_string()),
                Err(e) => {
                    warn!(error = %e, "push task failed");
                    continue;
                }
            };
            warn!(%peer, cid = %event.cid.short_hex(), reason = %failure, "push failed");
            report.failed.push((peer, failure));
        }
        report.delivered.sort();
        report
    }

    /// Forward every event on `events` to subscribed peers until the stream
    /// closes or the replicator is dropped.
    pub fn spawn_push_loop(self: &Arc<Self>, mut events: EventStream) -> JoinHandle<()> {
        let replicator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(replicator) = replicator.upgrade() else { break };
                        replicator.fan_out(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push loop lagged; peers catch up on their next pull");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl MessageHandler for Replicator {
    async fn handle(&self, from: &PeerId, msg: SyncMessage) -> SyncMessage {
        self.serve(from, msg).await
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("local", &self.local)
            .field("options", &self.options)
            .finish()
    }
}

fn envelope(block: &CommitBlock) -> BlockEnvelope {
    BlockEnvelope {
        cid: block.cid(),
        data: block.bytes().to_vec(),
    }
}

fn decode_all(envelopes: &[BlockEnvelope]) -> SyncResult<Vec<CommitBlock>> {
    envelopes
        .iter()
        .map(|e| CommitBlock::decode(&e.cid, &e.data).map_err(SyncError::from))
        .collect()
}

/// Every link must resolve (within the batch or the store) to a commit of
/// the same key, and each block's priority must follow from its parents'.
/// A composite must map each field to a commit of that field in the same
/// document.
fn verify_parents(txn: &mut Transaction, batch: &BTreeMap<Cid, CommitBlock>) -> SyncResult<()> {
    let mut reader = BlockReader::new(txn);
    for block in batch.values() {
        let mut priorities = Vec::with_capacity(block.links().len());
        for link in block.links() {
            let parent = load_referenced(&mut reader, batch, block, link)?;
            if parent.doc_key() != block.doc_key() || parent.field() != block.field() {
                return Err(CrdtError::InvalidBlock {
                    cid: block.cid(),
                    reason: format!("links {link} of another key"),
                }
                .into());
            }
            priorities.push(parent.priority());
        }
        block.verify_priority(priorities)?;

        if let Delta::Composite { fields } = block.delta() {
            for (field, cid) in fields {
                let target = load_referenced(&mut reader, batch, block, cid)?;
                if target.doc_key() != block.doc_key() || target.field() != Some(field) {
                    return Err(CrdtError::InvalidBlock {
                        cid: block.cid(),
                        reason: format!("maps field {field} to {cid}, which is not a commit of that field"),
                    }
                    .into());
                }
            }
        }
    }
    Ok(())
}

fn load_referenced(
    reader: &mut BlockReader<'_>,
    batch: &BTreeMap<Cid, CommitBlock>,
    block: &CommitBlock,
    cid: &Cid,
) -> SyncResult<CommitBlock> {
    if let Some(found) = batch.get(cid) {
        return Ok(found.clone());
    }
    match reader.load(cid) {
        Ok(found) => Ok(found),
        Err(ClockError::Store(e)) if e.is_not_found() => Err(SyncError::MissingAncestors {
            head: block.cid(),
            missing: vec![*cid],
        }),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tessera_crdt::{CompositeRegister, FieldKind, LwwRegister, ScalarValue, SchemaRegistry, SchemaVersion};
    use tessera_events::{EventBus, EventFilter};
    use tessera_protocol::codes;
    use tessera_store::{KvTxn, MemoryStore, StoreResult};
    use tessera_types::SchemaVersionId;

    use crate::transport::MemoryNetwork;

    struct Peer {
        id: PeerId,
        store: Arc<MemoryStore>,
        clock: Arc<MerkleClock>,
        replicator: Arc<Replicator>,
    }

    impl Peer {
        fn new(network: &Arc<MemoryNetwork>, name: &str) -> Self {
            Self::with_events(network, name, None)
        }

        fn with_events(network: &Arc<MemoryNetwork>, name: &str, events: Option<Arc<EventBus>>) -> Self {
            let store = Arc::new(MemoryStore::new());
            Self::build(network, name, events, store.clone(), store)
        }

        /// A peer whose replicator writes through `backend`, which must wrap
        /// `store`.
        fn build(
            network: &Arc<MemoryNetwork>,
            name: &str,
            events: Option<Arc<EventBus>>,
            store: Arc<MemoryStore>,
            backend: Arc<dyn TxnStore>,
        ) -> Self {
            let id = PeerId::new(name);
            let schemas = SchemaRegistry::new();
            schemas
                .register(
                    SchemaVersion::new(v1())
                        .with_field(field("name"), FieldKind::String)
                        .with_field(field("age"), FieldKind::Int),
                )
                .unwrap();
            let mut clock = MerkleClock::new(Arc::new(schemas));
            if let Some(events) = events {
                clock = clock.with_events(events);
            }
            let clock = Arc::new(clock);
            let replicator = Arc::new(Replicator::new(
                id.clone(),
                backend,
                Arc::clone(&clock),
                Arc::new(SessionTable::new()),
                Arc::new(network.transport(id.clone())),
                ReplicatorOptions::default(),
            ));
            let handler: Arc<dyn MessageHandler> = replicator.clone();
            network.register(id.clone(), Arc::downgrade(&handler));
            Self {
                id,
                store,
                clock,
                replicator,
            }
        }

        fn set(&self, name: &str, value: impl Into<ScalarValue>) -> CommitBlock {
            let mut txn = Transaction::begin(self.store.as_ref(), false).unwrap();
            let key = HeadKey::field(doc(), field(name));
            let block = self
                .clock
                .add_delta(&mut txn, &key, LwwRegister::delta(value.into()), &v1())
                .unwrap();
            txn.commit().unwrap();
            block
        }

        fn compose(&self) -> CommitBlock {
            let mut txn = Transaction::begin(self.store.as_ref(), false).unwrap();
            let block = self.clock.compose(&mut txn, &doc(), &v1()).unwrap();
            txn.commit().unwrap();
            block
        }

        fn key_heads(&self, key: &HeadKey) -> Vec<Cid> {
            let mut txn = Transaction::begin(self.store.as_ref(), true).unwrap();
            txn.heads()
                .get(key)
                .unwrap()
                .into_iter()
                .map(|(cid, _)| cid)
                .collect()
        }

        fn heads(&self, name: &str) -> Vec<Cid> {
            self.key_heads(&HeadKey::field(doc(), field(name)))
        }
    }

    type Race = Box<dyn FnOnce() + Send>;

    /// Runs a queued write against the inner store right before the next
    /// read-write transaction commits, so that transaction loses the race.
    struct RacingStore {
        inner: Arc<MemoryStore>,
        race: Mutex<Option<Race>>,
        writes_begun: AtomicUsize,
    }

    impl RacingStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                race: Mutex::new(None),
                writes_begun: AtomicUsize::new(0),
            }
        }

        fn arm(&self, race: impl FnOnce() + Send + 'static) {
            *self.race.lock().unwrap() = Some(Box::new(race));
        }
    }

    impl TxnStore for RacingStore {
        fn begin(&self, readonly: bool) -> StoreResult<Box<dyn KvTxn>> {
            let txn = self.inner.begin(readonly)?;
            let race = if readonly {
                None
            } else {
                self.writes_begun.fetch_add(1, Ordering::SeqCst);
                self.race.lock().unwrap().take()
            };
            Ok(Box::new(RacingTxn { txn, race }))
        }
    }

    struct RacingTxn {
        txn: Box<dyn KvTxn>,
        race: Option<Race>,
    }

    impl KvTxn for RacingTxn {
        fn is_readonly(&self) -> bool {
            self.txn.is_readonly()
        }

        fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
            self.txn.get(key)
        }

        fn put(&mut self, key: &[u8], value: Vec<u8>) -> StoreResult<()> {
            self.txn.put(key, value)
        }

        fn delete(&mut self, key: &[u8]) -> StoreResult<()> {
            self.txn.delete(key)
        }

        fn scan_prefix(&mut self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
            self.txn.scan_prefix(prefix)
        }

        fn commit(self: Box<Self>) -> StoreResult<()> {
            let RacingTxn { txn, race } = *self;
            if let Some(race) = race {
                race();
            }
            txn.commit()
        }

        fn discard(self: Box<Self>) {
            self.txn.discard()
        }
    }

    fn v1() -> SchemaVersionId {
        SchemaVersionId::new("v1").unwrap()
    }

    fn doc() -> DocKey {
        DocKey::new("doc1").unwrap()
    }

    fn field(name: &str) -> FieldId {
        FieldId::new(name).unwrap()
    }

    // ---------------------------------------------------------------
    // Push
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn push_backfills_missing_ancestors() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let b = Peer::new(&network, "b");
        a.set("name", "one");
        a.set("name", "two");
        let tip = a.set("name", "three");

        let heads = a.replicator.push_block(&b.id, &tip).await.unwrap();
        assert_eq!(heads, vec![tip.cid()]);
        assert_eq!(b.heads("name"), vec![tip.cid()]);
        assert_eq!(b.store.len(), a.store.len());
    }

    #[tokio::test]
    async fn duplicate_push_is_idempotent() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let b = Peer::new(&network, "b");
        let block = a.set("name", "Alice");

        a.replicator.push_block(&b.id, &block).await.unwrap();
        let entries = b.store.len();
        let heads = a.replicator.push_block(&b.id, &block).await.unwrap();
        assert_eq!(heads, vec![block.cid()]);
        assert_eq!(b.store.len(), entries);
    }

    #[tokio::test]
    async fn tampered_push_is_rejected_without_writes() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let b = Peer::new(&network, "b");
        let genuine = a.set("name", "Alice");
        let forged = CommitBlock::build(doc(), Some(field("name")), &[], LwwRegister::delta("Mallory".into()), v1())
            .unwrap();

        let reply = b
            .replicator
            .serve(
                &a.id,
                SyncMessage::PushLogRequest(PushBody {
                    doc_key: doc(),
                    field: Some(field("name")),
                    cid: genuine.cid(),
                    schema_version: v1(),
                    creator: a.id.clone(),
                    block: forged.bytes().to_vec(),
                }),
            )
            .await;
        assert!(matches!(reply, SyncMessage::Error { code: codes::INVALID, .. }));
        assert!(b.heads("name").is_empty());
        assert!(b.store.is_empty());
    }

    #[tokio::test]
    async fn incompatible_push_is_rejected() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let b = Peer::new(&network, "b");
        let wrong_kind =
            CommitBlock::build(doc(), Some(field("age")), &[], LwwRegister::delta("old".into()), v1()).unwrap();

        let err = a.replicator.push_block(&b.id, &wrong_kind).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote { code: codes::INCOMPATIBLE_DELTA, .. }));
        assert!(b.store.is_empty());
    }

    #[tokio::test]
    async fn unreachable_sender_leaves_no_partial_state() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let b = Peer::new(&network, "b");
        a.set("name", "one");
        let tip = a.set("name", "two");

        // `a` pushes, then goes away before `b` can backfill.
        let push = SyncMessage::PushLogRequest(PushBody {
            doc_key: doc(),
            field: Some(field("name")),
            cid: tip.cid(),
            schema_version: v1(),
            creator: a.id.clone(),
            block: tip.bytes().to_vec(),
        });
        network.set_online(&a.id, false);
        let reply = b.replicator.serve(&a.id, push).await;
        assert!(matches!(reply, SyncMessage::Error { code: codes::MISSING_ANCESTORS, .. }));
        assert!(b.store.is_empty());

        network.set_online(&a.id, true);
        b.replicator.pull_document(&a.id, &doc()).await.unwrap();
        assert_eq!(b.heads("name"), vec![tip.cid()]);
        assert_eq!(b.store.len(), a.store.len());
    }

    #[tokio::test]
    async fn composite_mapping_a_foreign_commit_is_rejected() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let b = Peer::new(&network, "b");
        let age = a.set("age", 30i64);
        let composite = |target: &CommitBlock| {
            CommitBlock::build(
                doc(),
                None,
                &[],
                CompositeRegister::delta(BTreeMap::from([(field("name"), target.cid())])),
                v1(),
            )
            .unwrap()
        };

        // `name` pointing at a commit of `age`.
        let wrong_field = composite(&age);
        let err = b
            .replicator
            .ingest(&a.id, &doc(), vec![wrong_field.clone(), age.clone()], Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Crdt(CrdtError::InvalidBlock { cid, .. }) if cid == wrong_field.cid()));
        assert!(b.store.is_empty());

        // `name` pointing at another document-level commit.
        let nested = composite(&wrong_field);
        let err = b
            .replicator
            .ingest(&a.id, &doc(), vec![nested, wrong_field], Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Crdt(CrdtError::InvalidBlock { .. })));
        assert!(b.store.is_empty());
    }

    #[tokio::test]
    async fn conflicting_apply_retries_without_losing_the_local_write() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let store = Arc::new(MemoryStore::new());
        let racing = Arc::new(RacingStore::new(store.clone()));
        let b = Peer::build(&network, "b", None, store, racing.clone());
        let received = a.set("name", "Alice");

        // A local write to the same key commits while the first apply
        // transaction is still open.
        let landed = Arc::new(Mutex::new(None));
        racing.arm({
            let clock = Arc::clone(&b.clock);
            let store = b.store.clone();
            let landed = Arc::clone(&landed);
            move || {
                let mut txn = Transaction::begin(store.as_ref(), false).unwrap();
                let key = HeadKey::field(doc(), field("name"));
                let block = clock
                    .add_delta(&mut txn, &key, LwwRegister::delta("Bob".into()), &v1())
                    .unwrap();
                txn.commit().unwrap();
                *landed.lock().unwrap() = Some(block.cid());
            }
        });

        let report = b
            .replicator
            .ingest(&a.id, &doc(), vec![received.clone()], Vec::new())
            .await
            .unwrap();
        assert_eq!(racing.writes_begun.load(Ordering::SeqCst), 2);
        assert_eq!(report.stored, 1);
        assert!(report.changed());

        let local = landed.lock().unwrap().expect("local write landed");
        let mut expected = vec![received.cid(), local];
        expected.sort();
        assert_eq!(b.heads("name"), expected);
    }

    #[tokio::test]
    async fn fetch_rounds_are_bounded() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let id = PeerId::new("b");
        let store = Arc::new(MemoryStore::new());
        let options = ReplicatorOptions {
            max_fetch_rounds: 0,
            ..ReplicatorOptions::default()
        };
        let b = Replicator::new(
            id.clone(),
            store.clone(),
            Arc::clone(&a.clock),
            Arc::new(SessionTable::new()),
            Arc::new(network.transport(id)),
            options,
        );
        a.set("name", "one");
        let tip = a.set("name", "two");

        let err = b.ingest(&a.id, &doc(), vec![tip], Vec::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingAncestors { .. }));
        assert!(store.is_empty());
    }

    // ---------------------------------------------------------------
    // Serving logs
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn get_log_stops_at_known() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let one = a.set("name", "one");
        let two = a.set("name", "two");
        let three = a.set("name", "three");

        let reply = a
            .replicator
            .serve(
                &PeerId::new("b"),
                SyncMessage::GetLogRequest {
                    doc_key: doc(),
                    field: Some(field("name")),
                    head: three.cid(),
                    known: vec![one.cid()],
                    limit: None,
                },
            )
            .await;
        match reply {
            SyncMessage::GetLogResponse { blocks, continuation } => {
                let cids: Vec<Cid> = blocks.iter().map(|b| b.cid).collect();
                assert_eq!(cids, vec![three.cid(), two.cid()]);
                assert!(continuation.is_empty());
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_log_for_unknown_head_is_not_found() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let reply = a
            .replicator
            .serve(
                &PeerId::new("b"),
                SyncMessage::GetLogRequest {
                    doc_key: doc(),
                    field: None,
                    head: Cid::new(Cid::DAG_COMMIT, [9; 32]),
                    known: vec![],
                    limit: None,
                },
            )
            .await;
        assert!(matches!(reply, SyncMessage::Error { code: codes::NOT_FOUND, .. }));
    }

    #[tokio::test]
    async fn doc_graph_transfers_whole_document() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let b = Peer::new(&network, "b");
        a.set("name", "Alice");
        a.set("age", 30i64);
        let composite = a.compose();

        let report = b.replicator.fetch_document_graph(&a.id, &doc()).await.unwrap();
        assert_eq!(report.stored, 3);
        assert_eq!(report.fetch_rounds, 0);
        let composite_key = HeadKey::composite(doc());
        assert_eq!(b.key_heads(&composite_key), vec![composite.cid()]);
        assert_eq!(b.heads("name"), a.heads("name"));
        assert_eq!(b.heads("age"), a.heads("age"));

        let again = b.replicator.fetch_document_graph(&a.id, &doc()).await.unwrap();
        assert_eq!(again.stored, 0);
        assert!(!again.changed());
    }

    #[tokio::test]
    async fn doc_graph_rejects_whole_batch_on_bad_block() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let b = Peer::new(&network, "b");
        a.set("name", "Alice");
        // Declared Int on both peers, but written as a string behind the
        // clock's back.
        let bad = CommitBlock::build(doc(), Some(field("age")), &[], LwwRegister::delta("old".into()), v1()).unwrap();
        let mut txn = Transaction::begin(a.store.as_ref(), false).unwrap();
        txn.blocks().put(&bad.cid(), bad.bytes()).unwrap();
        txn.heads().put(&HeadKey::field(doc(), field("age")), &bad.cid(), 0).unwrap();
        txn.commit().unwrap();

        let err = b.replicator.fetch_document_graph(&a.id, &doc()).await.unwrap_err();
        assert!(matches!(err, SyncError::Crdt(CrdtError::IncompatibleDelta(_))));
        assert!(b.store.is_empty());
    }

    // ---------------------------------------------------------------
    // Fan-out
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn fan_out_reaches_connected_subscribers_only() {
        let network = MemoryNetwork::new();
        let bus = Arc::new(EventBus::new(16));
        let a = Peer::with_events(&network, "a", Some(Arc::clone(&bus)));
        let b = Peer::new(&network, "b");
        let c = Peer::new(&network, "c");
        let mut events = bus.subscribe(EventFilter::default());

        let sessions = a.replicator.sessions();
        sessions.connect(b.id.clone());
        sessions.subscribe(b.id.clone(), doc());
        sessions.subscribe(c.id.clone(), doc());

        let block = a.set("name", "Alice");
        let event = events.recv().await.unwrap();
        let report = a.replicator.fan_out(&event).await;
        assert_eq!(report.delivered, vec![b.id.clone()]);
        assert!(report.failed.is_empty());
        assert_eq!(b.heads("name"), vec![block.cid()]);
        assert!(c.heads("name").is_empty());
    }

    #[tokio::test]
    async fn fan_out_reports_unreachable_peers() {
        let network = MemoryNetwork::new();
        let a = Peer::new(&network, "a");
        let b = Peer::new(&network, "b");
        let ghost = PeerId::new("ghost");
        for peer in [&b.id, &ghost] {
            a.replicator.sessions().connect(peer.clone());
            a.replicator.sessions().subscribe(peer.clone(), doc());
        }
        let block = a.set("name", "Alice");

        let event = tessera_clock::update_event(&block);
        let report = a.replicator.fan_out(&event).await;
        assert_eq!(report.delivered, vec![b.id.clone()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, ghost);
    }
}
