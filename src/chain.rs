//! Block tree and active chain
//!
//! Every accepted header becomes a [`BlockTreeEntry`]. Entries are reference
//! counted and point to their parent, so any entry handed out keeps its whole
//! ancestry alive and can be walked without holding a lock. The mutable part
//! of an entry (validation status, storage positions, arrival order) sits
//! behind a small per-entry mutex.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::constants::MEDIAN_TIME_SPAN;
use crate::pow::{get_block_proof, U256};
use crate::storage::BlockPos;
use crate::types::*;

/// Validation progress of a tree entry
///
/// `HeaderOnly → HeadersValid → FullyValid`; `Invalid` absorbs from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Header accepted, body not yet received
    HeaderOnly,
    /// Body stored and checked without the coins view
    HeadersValid,
    /// Connected to the chainstate at least once
    FullyValid,
    /// Failed validation itself, or descends from a block that did
    Invalid { failed_child: bool },
}

impl BlockStatus {
    pub fn is_invalid(self) -> bool {
        matches!(self, BlockStatus::Invalid { .. })
    }

    fn rank(self) -> u8 {
        match self {
            BlockStatus::HeaderOnly => 0,
            BlockStatus::HeadersValid => 1,
            BlockStatus::FullyValid => 2,
            BlockStatus::Invalid { .. } => 3,
        }
    }
}

#[derive(Debug, Clone)]
struct EntryState {
    status: BlockStatus,
    data_pos: Option<BlockPos>,
    undo_pos: Option<BlockPos>,
    /// Order in which block bodies arrived; 0 until then
    sequence_id: u64,
}

/// Node of the block tree
#[derive(Debug)]
pub struct BlockTreeEntry {
    pub hash: BlockHash,
    pub header: BlockHeader,
    pub height: u32,
    /// Total work of the chain ending here
    pub chain_work: U256,
    parent: Option<Arc<BlockTreeEntry>>,
    skip: Option<Arc<BlockTreeEntry>>,
    state: Mutex<EntryState>,
}

/// Height the skip pointer of an entry at `height` jumps to
fn skip_height(height: u32) -> u32 {
    fn invert_lowest_one(n: u32) -> u32 {
        n & n.wrapping_sub(1)
    }
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Whether a walk at `height_walk` toward `target` should take the skip pointer
fn take_skip(height_walk: u32, target: u32) -> bool {
    let height_skip = skip_height(height_walk);
    let height_skip_prev = skip_height(height_walk - 1);
    height_skip == target
        || (height_skip > target && !(height_skip_prev + 2 < height_skip && height_skip_prev >= target))
}

impl BlockTreeEntry {
    /// The genesis entry
    pub fn genesis(header: BlockHeader) -> Arc<Self> {
        Arc::new(BlockTreeEntry {
            hash: header.block_hash(),
            header,
            height: 0,
            chain_work: get_block_proof(header.bits),
            parent: None,
            skip: None,
            state: Mutex::new(EntryState {
                status: BlockStatus::HeaderOnly,
                data_pos: None,
                undo_pos: None,
                sequence_id: 0,
            }),
        })
    }

    /// A new entry on top of `parent`
    pub fn extend(parent: &Arc<Self>, header: BlockHeader) -> Arc<Self> {
        let height = parent.height + 1;
        let skip = parent.ancestor_arc(skip_height(height));
        Arc::new(BlockTreeEntry {
            hash: header.block_hash(),
            header,
            height,
            chain_work: parent.chain_work + get_block_proof(header.bits),
            parent: Some(Arc::clone(parent)),
            skip,
            state: Mutex::new(EntryState {
                status: BlockStatus::HeaderOnly,
                data_pos: None,
                undo_pos: None,
                sequence_id: 0,
            }),
        })
    }

    pub fn parent(&self) -> Option<&BlockTreeEntry> {
        self.parent.as_deref()
    }

    pub fn parent_arc(&self) -> Option<&Arc<BlockTreeEntry>> {
        self.parent.as_ref()
    }

    /// Ancestor at `height`, using skip pointers for long walks
    pub fn ancestor(&self, height: u32) -> Option<&BlockTreeEntry> {
        if height > self.height {
            return None;
        }
        let mut walk: &BlockTreeEntry = self;
        while walk.height > height {
            walk = match (&walk.skip, &walk.parent) {
                (Some(skip), _) if take_skip(walk.height, height) => skip,
                (_, Some(parent)) => parent,
                _ => return None,
            };
        }
        Some(walk)
    }

    pub fn ancestor_arc(self: &Arc<Self>, height: u32) -> Option<Arc<BlockTreeEntry>> {
        if height > self.height {
            return None;
        }
        let mut walk: &Arc<BlockTreeEntry> = self;
        while walk.height > height {
            walk = match (&walk.skip, &walk.parent) {
                (Some(skip), _) if take_skip(walk.height, height) => skip,
                (_, Some(parent)) => parent,
                _ => return None,
            };
        }
        Some(Arc::clone(walk))
    }

    /// Median of the timestamps of this entry and up to ten ancestors
    pub fn median_time_past(&self) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(self);
        while let Some(entry) = walk {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(entry.header.timestamp as i64);
            walk = entry.parent();
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    pub fn status(&self) -> BlockStatus {
        self.state.lock().status
    }

    /// Move the status forward; never leaves `Invalid` and never goes back
    pub fn raise_status(&self, status: BlockStatus) -> bool {
        let mut state = self.state.lock();
        if state.status.is_invalid() || status.rank() <= state.status.rank() {
            return false;
        }
        state.status = status;
        true
    }

    pub fn set_invalid(&self, failed_child: bool) {
        let mut state = self.state.lock();
        if !matches!(state.status, BlockStatus::Invalid { failed_child: false }) {
            state.status = BlockStatus::Invalid { failed_child };
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.status().is_invalid()
    }

    pub fn has_data(&self) -> bool {
        self.state.lock().data_pos.is_some()
    }

    pub fn data_pos(&self) -> Option<BlockPos> {
        self.state.lock().data_pos
    }

    pub fn undo_pos(&self) -> Option<BlockPos> {
        self.state.lock().undo_pos
    }

    pub fn set_data_pos(&self, pos: BlockPos, sequence_id: u64) {
        let mut state = self.state.lock();
        state.data_pos = Some(pos);
        state.sequence_id = sequence_id;
    }

    pub fn set_undo_pos(&self, pos: BlockPos) {
        self.state.lock().undo_pos = Some(pos);
    }

    pub fn sequence_id(&self) -> u64 {
        self.state.lock().sequence_id
    }

    /// Snapshot used to persist the entry
    pub fn to_record(&self) -> EntryRecord {
        let state = self.state.lock();
        EntryRecord {
            header: self.header,
            height: self.height,
            status: state.status,
            data_pos: state.data_pos,
            undo_pos: state.undo_pos,
            sequence_id: state.sequence_id,
        }
    }

    fn apply_record(&self, record: &EntryRecord) {
        let mut state = self.state.lock();
        state.status = record.status;
        state.data_pos = record.data_pos;
        state.undo_pos = record.undo_pos;
        state.sequence_id = record.sequence_id;
    }
}

impl PartialEq for BlockTreeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for BlockTreeEntry {}

/// Persisted form of a tree entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub header: BlockHeader,
    pub height: u32,
    pub status: BlockStatus,
    pub data_pos: Option<BlockPos>,
    pub undo_pos: Option<BlockPos>,
    pub sequence_id: u64,
}

/// Last common entry of two branches
pub fn find_fork<'a>(a: &'a BlockTreeEntry, b: &'a BlockTreeEntry) -> Option<&'a BlockTreeEntry> {
    let height = a.height.min(b.height);
    let mut a = a.ancestor(height)?;
    let mut b = b.ancestor(height)?;
    while a.hash != b.hash {
        a = a.parent()?;
        b = b.parent()?;
    }
    Some(a)
}

/// A linear path from genesis to a tip
#[derive(Debug, Clone, Default)]
pub struct Chain {
    entries: Vec<Arc<BlockTreeEntry>>,
}

impl Chain {
    pub fn new() -> Self {
        Chain::default()
    }

    pub fn tip(&self) -> Option<&Arc<BlockTreeEntry>> {
        self.entries.last()
    }

    pub fn genesis(&self) -> Option<&Arc<BlockTreeEntry>> {
        self.entries.first()
    }

    /// Height of the tip, -1 when empty
    pub fn height(&self) -> i64 {
        self.entries.len() as i64 - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn at(&self, height: u32) -> Option<&Arc<BlockTreeEntry>> {
        self.entries.get(height as usize)
    }

    pub fn contains(&self, entry: &BlockTreeEntry) -> bool {
        self.at(entry.height).map(|e| e.hash == entry.hash).unwrap_or(false)
    }

    /// Successor of `entry` when it is on this chain
    pub fn next(&self, entry: &BlockTreeEntry) -> Option<&Arc<BlockTreeEntry>> {
        if self.contains(entry) {
            self.at(entry.height + 1)
        } else {
            None
        }
    }

    /// Last entry of this chain that is also an ancestor of `entry`
    pub fn find_fork(&self, entry: &BlockTreeEntry) -> Option<&Arc<BlockTreeEntry>> {
        let tip_height = self.tip()?.height;
        let mut walk = entry.ancestor(entry.height.min(tip_height));
        while let Some(candidate) = walk {
            if self.contains(candidate) {
                return self.at(candidate.height);
            }
            walk = candidate.parent();
        }
        None
    }

    /// Repoint the chain at `tip`, rewriting only the entries past the fork
    pub fn set_tip(&mut self, tip: Option<Arc<BlockTreeEntry>>) {
        let tip = match tip {
            Some(tip) => tip,
            None => {
                self.entries.clear();
                return;
            }
        };
        let tip_height = tip.height as usize;
        let mut pending = Vec::new();
        let mut walk = Some(tip);
        while let Some(entry) = walk {
            if self.contains(&entry) {
                break;
            }
            walk = entry.parent_arc().cloned();
            pending.push(entry);
        }
        let keep = pending.last().map(|e| e.height as usize).unwrap_or(tip_height + 1);
        self.entries.truncate(keep);
        self.entries.extend(pending.into_iter().rev());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BlockTreeEntry>> {
        self.entries.iter()
    }
}

/// Ordering key for chain tip candidates: most work first, then first seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CandidateKey {
    work: Reverse<U256>,
    sequence_id: u64,
    hash: BlockHash,
}

impl CandidateKey {
    fn of(entry: &BlockTreeEntry) -> Self {
        CandidateKey {
            work: Reverse(entry.chain_work),
            sequence_id: entry.sequence_id(),
            hash: entry.hash,
        }
    }
}

/// All known entries, the best header and the set of tip candidates
#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: HashMap<BlockHash, Arc<BlockTreeEntry>>,
    best_header: Option<Arc<BlockTreeEntry>>,
    candidates: BTreeMap<CandidateKey, Arc<BlockTreeEntry>>,
    next_sequence_id: u64,
}

impl BlockIndex {
    pub fn new() -> Self {
        BlockIndex {
            next_sequence_id: 1,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&Arc<BlockTreeEntry>> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn best_header(&self) -> Option<&Arc<BlockTreeEntry>> {
        self.best_header.as_ref()
    }

    /// Insert a header whose parent is already indexed (or the genesis header)
    pub fn insert(&mut self, header: BlockHeader) -> Option<Arc<BlockTreeEntry>> {
        let hash = header.block_hash();
        if let Some(existing) = self.entries.get(&hash) {
            return Some(Arc::clone(existing));
        }
        let entry = if header.prev_block_hash.is_null() && self.entries.is_empty() {
            BlockTreeEntry::genesis(header)
        } else {
            BlockTreeEntry::extend(self.entries.get(&header.prev_block_hash)?, header)
        };
        self.entries.insert(hash, Arc::clone(&entry));
        self.update_best_header(&entry);
        Some(entry)
    }

    fn update_best_header(&mut self, entry: &Arc<BlockTreeEntry>) {
        if entry.is_invalid() {
            return;
        }
        let better = match &self.best_header {
            Some(best) => entry.chain_work > best.chain_work,
            None => true,
        };
        if better {
            self.best_header = Some(Arc::clone(entry));
        }
    }

    /// Recompute the best header among entries not known to be invalid
    pub fn recompute_best_header(&mut self) {
        self.best_header = self
            .entries
            .values()
            .filter(|entry| !entry.is_invalid())
            .max_by(|a, b| a.chain_work.cmp(&b.chain_work).then(b.height.cmp(&a.height)))
            .cloned();
    }

    /// Record that the body of `entry` is stored at `pos`
    pub fn received_data(&mut self, entry: &Arc<BlockTreeEntry>, pos: BlockPos) {
        let sequence_id = self.next_sequence_id;
        self.next_sequence_id += 1;
        entry.set_data_pos(pos, sequence_id);
        entry.raise_status(BlockStatus::HeadersValid);
    }

    pub fn add_candidate(&mut self, entry: &Arc<BlockTreeEntry>) {
        if !entry.is_invalid() {
            self.candidates.insert(CandidateKey::of(entry), Arc::clone(entry));
        }
    }

    pub fn remove_candidate(&mut self, entry: &BlockTreeEntry) {
        self.candidates.remove(&CandidateKey::of(entry));
    }

    /// Drop candidates with less work than `work`, keeping equal work ones
    pub fn prune_candidates(&mut self, work: &U256) {
        self.candidates.retain(|key, _| key.work.0 >= *work);
    }

    /// Candidates in preference order
    pub fn candidates(&self) -> Vec<Arc<BlockTreeEntry>> {
        self.candidates.values().cloned().collect()
    }

    /// Mark every descendant of `failed` as invalid and forget them as candidates
    pub fn invalidate_descendants(&mut self, failed: &BlockTreeEntry) {
        for entry in self.entries.values() {
            if entry.height > failed.height
                && entry.ancestor(failed.height).map(|a| a.hash == failed.hash).unwrap_or(false)
            {
                entry.set_invalid(true);
            }
        }
        self.candidates.retain(|_, entry| !entry.is_invalid());
        if self.best_header.as_ref().map(|b| b.is_invalid()).unwrap_or(false) {
            self.recompute_best_header();
        }
    }

    /// Highest-work invalid entry, used to warn about large invalid chains
    pub fn best_invalid(&self) -> Option<&Arc<BlockTreeEntry>> {
        self.entries
            .values()
            .filter(|entry| entry.is_invalid())
            .max_by(|a, b| a.chain_work.cmp(&b.chain_work))
    }

    /// Rebuild from persisted records; parents are inserted before children
    pub fn load(records: Vec<EntryRecord>) -> Self {
        let mut index = BlockIndex::new();
        let mut records = records;
        records.sort_by_key(|record| record.height);
        for record in &records {
            if let Some(entry) = index.insert(record.header) {
                entry.apply_record(record);
                index.next_sequence_id = index.next_sequence_id.max(record.sequence_id + 1);
            }
        }
        index.recompute_best_header();
        index
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BlockTreeEntry>> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: BlockHash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block_hash: prev,
            merkle_root: [0u8; 32],
            timestamp: 1_000 + nonce,
            bits: 0x207fffff,
            nonce,
        }
    }

    fn build_branch(index: &mut BlockIndex, from: BlockHash, len: u32, salt: u32) -> Vec<Arc<BlockTreeEntry>> {
        let mut prev = from;
        let mut out = Vec::new();
        for i in 0..len {
            let entry = index.insert(header(prev, salt * 10_000 + i)).unwrap();
            prev = entry.hash;
            out.push(entry);
        }
        out
    }

    #[test]
    fn test_skip_heights() {
        assert_eq!(skip_height(0), 0);
        assert_eq!(skip_height(1), 0);
        assert_eq!(skip_height(2), 0);
        assert_eq!(skip_height(8), 0);
        assert_eq!(skip_height(12), 8);
        for h in 2..1000 {
            assert!(skip_height(h) < h);
        }
    }

    #[test]
    fn test_ancestor_walk() {
        let mut index = BlockIndex::new();
        let genesis = index.insert(header(BlockHash::all_zeros(), 0)).unwrap();
        let chain = build_branch(&mut index, genesis.hash, 300, 1);
        let tip = chain.last().unwrap();
        assert_eq!(tip.height, 300);
        for h in [0u32, 1, 17, 128, 255, 299, 300] {
            let a = tip.ancestor(h).unwrap();
            assert_eq!(a.height, h);
            assert_eq!(tip.ancestor_arc(h).unwrap().hash, a.hash);
        }
        assert_eq!(tip.ancestor(0).unwrap().hash, genesis.hash);
        assert!(tip.ancestor(301).is_none());
    }

    #[test]
    fn test_chain_work_increases() {
        let mut index = BlockIndex::new();
        let genesis = index.insert(header(BlockHash::all_zeros(), 0)).unwrap();
        let chain = build_branch(&mut index, genesis.hash, 5, 1);
        let mut previous = genesis.chain_work;
        for entry in chain {
            assert!(entry.chain_work > previous);
            previous = entry.chain_work;
        }
    }

    #[test]
    fn test_insert_requires_parent() {
        let mut index = BlockIndex::new();
        index.insert(header(BlockHash::all_zeros(), 0)).unwrap();
        assert!(index.insert(header(BlockHash::from_byte_array([9; 32]), 1)).is_none());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_find_fork_and_set_tip() {
        let mut index = BlockIndex::new();
        let genesis = index.insert(header(BlockHash::all_zeros(), 0)).unwrap();
        let trunk = build_branch(&mut index, genesis.hash, 10, 1);
        let branch = build_branch(&mut index, trunk[4].hash, 8, 2);

        let mut chain = Chain::new();
        chain.set_tip(Some(Arc::clone(trunk.last().unwrap())));
        assert_eq!(chain.height(), 10);
        assert!(chain.contains(&trunk[3]));

        let fork = find_fork(trunk.last().unwrap(), branch.last().unwrap()).unwrap();
        assert_eq!(fork.hash, trunk[4].hash);
        assert_eq!(chain.find_fork(branch.last().unwrap()).unwrap().hash, trunk[4].hash);

        chain.set_tip(Some(Arc::clone(branch.last().unwrap())));
        assert_eq!(chain.height(), 13);
        assert!(!chain.contains(&trunk[6]));
        assert!(chain.contains(&branch[0]));
        assert_eq!(chain.at(5).unwrap().hash, branch[0].hash);
        assert_eq!(chain.next(&trunk[4]).unwrap().hash, branch[0].hash);
        assert_eq!(chain.genesis().unwrap().hash, genesis.hash);
    }

    #[test]
    fn test_status_transitions() {
        let entry = BlockTreeEntry::genesis(header(BlockHash::all_zeros(), 0));
        assert_eq!(entry.status(), BlockStatus::HeaderOnly);
        assert!(entry.raise_status(BlockStatus::FullyValid));
        assert!(!entry.raise_status(BlockStatus::HeadersValid));
        entry.set_invalid(false);
        assert!(!entry.raise_status(BlockStatus::FullyValid));
        entry.set_invalid(true);
        assert_eq!(entry.status(), BlockStatus::Invalid { failed_child: false });
    }

    #[test]
    fn test_candidate_order() {
        let mut index = BlockIndex::new();
        let genesis = index.insert(header(BlockHash::all_zeros(), 0)).unwrap();
        let a = build_branch(&mut index, genesis.hash, 2, 1);
        let b = build_branch(&mut index, genesis.hash, 2, 2);
        let c = build_branch(&mut index, genesis.hash, 1, 3);
        for (entry, file) in [(&b[1], 0), (&a[1], 1), (&c[0], 2)] {
            index.received_data(entry, BlockPos { file, offset: 0 });
            index.add_candidate(entry);
        }
        let order: Vec<BlockHash> = index.candidates().iter().map(|e| e.hash).collect();
        // equal work: first received wins
        assert_eq!(order, vec![b[1].hash, a[1].hash, c[0].hash]);

        index.prune_candidates(&a[1].chain_work);
        assert_eq!(index.candidates().len(), 2);
    }

    #[test]
    fn test_invalidate_descendants() {
        let mut index = BlockIndex::new();
        let genesis = index.insert(header(BlockHash::all_zeros(), 0)).unwrap();
        let chain = build_branch(&mut index, genesis.hash, 5, 1);
        assert_eq!(index.best_header().unwrap().hash, chain[4].hash);
        chain[2].set_invalid(false);
        index.invalidate_descendants(&chain[2]);
        assert_eq!(chain[4].status(), BlockStatus::Invalid { failed_child: true });
        assert!(!chain[1].is_invalid());
        assert_eq!(index.best_header().unwrap().hash, chain[1].hash);
        assert_eq!(index.best_invalid().unwrap().hash, chain[4].hash);
    }

    #[test]
    fn test_median_time_past() {
        let mut index = BlockIndex::new();
        let genesis = index.insert(header(BlockHash::all_zeros(), 0)).unwrap();
        let chain = build_branch(&mut index, genesis.hash, 20, 0);
        // timestamps are 1000 + nonce; the last eleven are 1009..=1019
        assert_eq!(chain[19].median_time_past(), 1014);
        assert_eq!(genesis.median_time_past(), 1000);
    }

    #[test]
    fn test_load_from_records() {
        let mut index = BlockIndex::new();
        let genesis = index.insert(header(BlockHash::all_zeros(), 0)).unwrap();
        let chain = build_branch(&mut index, genesis.hash, 3, 1);
        index.received_data(&chain[2], BlockPos { file: 0, offset: 8 });
        let records: Vec<EntryRecord> = index.iter().map(|e| e.to_record()).collect();

        let reloaded = BlockIndex::load(records);
        assert_eq!(reloaded.len(), 4);
        let entry = reloaded.get(&chain[2].hash).unwrap();
        assert_eq!(entry.data_pos(), Some(BlockPos { file: 0, offset: 8 }));
        assert_eq!(entry.status(), BlockStatus::HeadersValid);
        assert_eq!(entry.chain_work, chain[2].chain_work);
    }
}
