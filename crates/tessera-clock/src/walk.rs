//! Traversal over stored commit blocks.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use tessera_crdt::CommitBlock;
use tessera_store::Transaction;
use tessera_types::Cid;

use crate::error::ClockResult;

/// Decoding reader over the block store of one transaction.
///
/// Blocks are decoded (and re-verified against their CID) once and cached
/// for the lifetime of the reader.
pub struct BlockReader<'t> {
    txn: &'t mut Transaction,
    cache: HashMap<Cid, CommitBlock>,
}

impl<'t> BlockReader<'t> {
    pub fn new(txn: &'t mut Transaction) -> Self {
        Self {
            txn,
            cache: HashMap::new(),
        }
    }

    /// Load and decode a block. Fails with a not-found store error if the
    /// block is absent.
    pub fn load(&mut self, cid: &Cid) -> ClockResult<CommitBlock> {
        if let Some(block) = self.cache.get(cid) {
            return Ok(block.clone());
        }
        let bytes = self.txn.blocks().get(cid)?;
        let block = CommitBlock::decode(cid, &bytes)?;
        self.cache.insert(*cid, block.clone());
        Ok(block)
    }

    pub fn has(&mut self, cid: &Cid) -> ClockResult<bool> {
        if self.cache.contains_key(cid) {
            return Ok(true);
        }
        Ok(self.txn.blocks().has(cid)?)
    }

    /// The references of `block` that are not stored.
    pub fn missing_references(&mut self, block: &CommitBlock) -> ClockResult<Vec<Cid>> {
        let mut missing = Vec::new();
        for cid in block.references() {
            if !self.has(&cid)? {
                missing.push(cid);
            }
        }
        Ok(missing)
    }

    /// Whether `target` is reachable from `from` by following links.
    ///
    /// Every ancestor has a strictly lower priority than its descendants, so
    /// the search never descends below `target_priority`.
    pub fn is_ancestor(&mut self, target: &Cid, target_priority: u64, from: &Cid) -> ClockResult<bool> {
        if target == from {
            return Ok(false);
        }
        let mut visited = HashSet::from([*from]);
        let mut queue = VecDeque::from([*from]);
        while let Some(cid) = queue.pop_front() {
            let block = self.load(&cid)?;
            if block.priority() <= target_priority {
                continue;
            }
            for link in block.links() {
                if link == target {
                    return Ok(true);
                }
                if visited.insert(*link) {
                    queue.push_back(*link);
                }
            }
        }
        Ok(false)
    }
}

/// Iterator over the commits reachable from a set of starting commits,
/// most recent first.
///
/// Commits are yielded in descending `(priority, cid)` order, so every
/// commit comes before all of its ancestors. The walk stops after the first
/// error.
pub struct DagWalk<'t> {
    reader: BlockReader<'t>,
    frontier: BinaryHeap<(u64, Cid)>,
    queued: HashSet<Cid>,
    failed: bool,
}

impl<'t> DagWalk<'t> {
    pub fn new(txn: &'t mut Transaction, starts: &[Cid]) -> ClockResult<Self> {
        let mut reader = BlockReader::new(txn);
        let mut frontier = BinaryHeap::new();
        let mut queued = HashSet::new();
        for cid in starts {
            if queued.insert(*cid) {
                frontier.push((reader.load(cid)?.priority(), *cid));
            }
        }
        Ok(Self {
            reader,
            frontier,
            queued,
            failed: false,
        })
    }

    fn expand(&mut self, cid: &Cid) -> ClockResult<CommitBlock> {
        let block = self.reader.load(cid)?;
        for link in block.links() {
            if self.queued.insert(*link) {
                let parent = self.reader.load(link)?;
                self.frontier.push((parent.priority(), *link));
            }
        }
        Ok(block)
    }
}

impl Iterator for DagWalk<'_> {
    type Item = ClockResult<CommitBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let (_, cid) = self.frontier.pop()?;
        match self.expand(&cid) {
            Ok(block) => Some(Ok(block)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// One page of a log traversal.
#[derive(Clone, Debug, Default)]
pub struct LogBatch {
    pub blocks: Vec<CommitBlock>,
    /// CIDs still to be visited when the page limit was reached; empty when
    /// the traversal is complete.
    pub remaining: Vec<Cid>,
}

/// Collect the blocks reachable from `from` through links and delta
/// references, breadth first, without descending past any CID in `known`.
///
/// At most `limit` blocks are returned; the unvisited frontier is reported
/// in [`LogBatch::remaining`] so the caller can continue from it.
pub fn collect_log(
    txn: &mut Transaction,
    from: &[Cid],
    known: &HashSet<Cid>,
    limit: usize,
) -> ClockResult<LogBatch> {
    let mut reader = BlockReader::new(txn);
    let mut visited: HashSet<Cid> = HashSet::new();
    let mut queue: VecDeque<Cid> = VecDeque::new();
    for cid in from {
        if !known.contains(cid) && visited.insert(*cid) {
            queue.push_back(*cid);
        }
    }

    let mut batch = LogBatch::default();
    while let Some(cid) = queue.pop_front() {
        if batch.blocks.len() >= limit.max(1) {
            queue.push_front(cid);
            break;
        }
        let block = reader.load(&cid)?;
        for reference in block.references() {
            if !known.contains(&reference) && visited.insert(reference) {
                queue.push_back(reference);
            }
        }
        batch.blocks.push(block);
    }
    batch.remaining = queue.into_iter().collect();
    Ok(batch)
}
