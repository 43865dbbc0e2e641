//! Chainstate manager
//!
//! Owns the block index, the active chain and the coins cache, and drives
//! every block through header acceptance, storage, connection and chain
//! selection.
//!
//! All mutation happens under one mutex. The active chain additionally sits
//! behind a read-write lock that is only written while that mutex is held, so
//! readers can take a consistent snapshot of the chain without waiting for a
//! block to finish validating. Events raised under the mutex are queued and
//! delivered after it is released, before the public method returns, so
//! callbacks may call back into the manager.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::block::{
    check_block, check_block_header, connect_block, contextual_check_block, contextual_check_block_header,
    disconnect_block, DisconnectResult,
};
use crate::chain::{BlockIndex, BlockStatus, BlockTreeEntry, Chain, EntryRecord};
use crate::coins::{CoinsView, CoinsViewCache, CoinsViewDb};
use crate::config::ChainstateManagerOptions;
use crate::constants::{DEFAULT_MAX_TIP_AGE, VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_MASK, VERSIONBITS_WINDOW};
use crate::context::Context;
use crate::error::{ConsensusError, Result};
use crate::notifications::{EventQueue, SynchronizationState, Warning};
use crate::pow::{get_block_proof, U256};
use crate::storage::{
    read_block_file, BlockPos, BlockStore, FlatFileBlockStore, KeyValueStore, MemoryBlockStore, RedbKeyValueStore,
    MemoryKeyValueStore, WriteBatch,
};
use crate::types::*;
use crate::validation_state::{BlockValidationResult, BlockValidationState};

const INDEX_PREFIX: u8 = b'b';

/// Extra work, in blocks at the tip's difficulty, an invalid chain needs
/// before it is worth a warning
const INVALID_CHAIN_WARNING_BLOCKS: u64 = 6;

/// Outcome of [`ChainstateManager::process_block`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedBlock {
    /// False when the block was already stored or was rejected
    pub new_block: bool,
    pub state: BlockValidationState,
}

fn index_key(hash: &BlockHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(INDEX_PREFIX);
    key.extend_from_slice(hash.as_bytes());
    key
}

fn wipe_store(store: &dyn KeyValueStore) -> Result<()> {
    let mut batch = WriteBatch::new();
    for (key, _) in store.scan_prefix(&[])? {
        batch.delete(key);
    }
    store.write_batch(batch)
}

fn load_index(store: &dyn KeyValueStore) -> Result<BlockIndex> {
    let records = store
        .scan_prefix(&[INDEX_PREFIX])?
        .into_iter()
        .map(|(_, value)| {
            serde_json::from_slice::<EntryRecord>(&value)
                .map_err(|e| ConsensusError::Storage(format!("corrupt block index record: {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;
    let index = BlockIndex::load(records);
    info!("Loaded {} block index entries", index.len());
    Ok(index)
}

/// Block version with version bits set that no deployment defines
fn unexpected_version(version: i32) -> bool {
    version & VERSIONBITS_TOP_MASK == VERSIONBITS_TOP_BITS && version & !VERSIONBITS_TOP_MASK != 0
}

struct ChainState {
    index: BlockIndex,
    coins: CoinsViewCache<CoinsViewDb>,
    /// Entries changed since the last flush
    dirty: HashSet<BlockHash>,
    /// Stored blocks waiting for the body of an ancestor, by parent hash
    unlinked: HashMap<BlockHash, Vec<Arc<BlockTreeEntry>>>,
    warnings: HashSet<Warning>,
    /// Whether a version bit reached lock-in in the period ending at a hash
    version_bit_periods: HashMap<BlockHash, bool>,
}

/// Unsets the reindexing flag on every exit path
struct ReindexGuard<'a>(&'a AtomicBool);

impl Drop for ReindexGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ChainstateManager {
    context: Arc<Context>,
    options: ChainstateManagerOptions,
    state: Mutex<ChainState>,
    active: RwLock<Chain>,
    blocks: Arc<dyn BlockStore>,
    index_db: Arc<dyn KeyValueStore>,
    events: EventQueue,
    pool: Option<ThreadPool>,
    reindexing: AtomicBool,
    left_ibd: AtomicBool,
}

impl ChainstateManager {
    /// Open (or create) the chainstate described by `options`
    ///
    /// A non-empty store is reloaded and the active chain resumes at the
    /// block the coins were last flushed at. After wiping the block tree the
    /// manager is empty until [`import_blocks`](Self::import_blocks) rebuilds
    /// it from the block files.
    pub fn new(context: Arc<Context>, options: ChainstateManagerOptions) -> Result<Self> {
        let params = context.chain_params();
        let (index_db, blocks): (Arc<dyn KeyValueStore>, Arc<dyn BlockStore>) = if options.block_tree_in_memory {
            (Arc::new(MemoryKeyValueStore::new()), Arc::new(MemoryBlockStore::new()))
        } else {
            (
                Arc::new(RedbKeyValueStore::open(
                    &options.blocks_dir.join("index").join("index.redb"),
                    "block_index",
                )?),
                Arc::new(FlatFileBlockStore::open(&options.blocks_dir, params.message_start)?),
            )
        };
        let coins_db: Arc<dyn KeyValueStore> = if options.chainstate_in_memory {
            Arc::new(MemoryKeyValueStore::new())
        } else {
            Arc::new(RedbKeyValueStore::open(
                &options.data_dir.join("chainstate").join("chainstate.redb"),
                "coins",
            )?)
        };

        if options.wipe_block_tree() {
            info!("Wiping block tree");
            wipe_store(index_db.as_ref())?;
        }
        if options.wipe_chainstate() {
            info!("Wiping chainstate");
            wipe_store(coins_db.as_ref())?;
        }

        let pool = match options.worker_threads() {
            0 => None,
            threads => Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("scriptch.{}", i))
                    .build()
                    .map_err(|e| ConsensusError::Fatal(format!("failed to start script check workers: {}", e)))?,
            ),
        };

        let index = load_index(index_db.as_ref())?;
        let coins = CoinsViewCache::new(CoinsViewDb::new(coins_db));
        let mut chain = Chain::new();
        if let Some(best) = coins.best_block()? {
            let tip = index
                .get(&best)
                .cloned()
                .ok_or_else(|| ConsensusError::Fatal(format!("chainstate tip {} is not in the block index", best)))?;
            info!("Chainstate at {} height {}", tip.hash, tip.height);
            chain.set_tip(Some(tip));
        }

        let manager = ChainstateManager {
            context,
            options,
            state: Mutex::new(ChainState {
                index,
                coins,
                dirty: HashSet::new(),
                unlinked: HashMap::new(),
                warnings: HashSet::new(),
                version_bit_periods: HashMap::new(),
            }),
            active: RwLock::new(chain),
            blocks,
            index_db,
            events: EventQueue::default(),
            pool,
            reindexing: AtomicBool::new(false),
            left_ibd: AtomicBool::new(false),
        };

        let loaded = {
            let mut cs = manager.state.lock();
            manager.load_chain(&mut cs)
        };
        manager.notify();
        loaded?;
        Ok(manager)
    }

    fn load_chain(&self, cs: &mut ChainState) -> Result<()> {
        if !self.options.wipe_block_tree() {
            self.ensure_genesis(cs)?;
        }
        self.rebuild_candidates(cs);
        self.activate_best_chain(cs, None)?;
        Ok(())
    }

    /// Deliver queued events; the state lock must not be held
    fn notify(&self) {
        self.events.deliver(self.context.subscribers());
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    fn now(&self) -> i64 {
        self.options.mock_time.unwrap_or_else(|| Utc::now().timestamp())
    }

    /// Notify a fatal error and turn it into [`ConsensusError::Fatal`]
    fn fatal(&self, err: ConsensusError) -> ConsensusError {
        let err = match err {
            ConsensusError::Fatal(_) => err,
            other => ConsensusError::Fatal(other.to_string()),
        };
        error!("{}", err);
        self.events.fatal_error(&err);
        err
    }

    pub fn synchronization_state(&self) -> SynchronizationState {
        let tip = self.active.read().tip().cloned();
        self.sync_state(tip.as_deref())
    }

    fn sync_state(&self, tip: Option<&BlockTreeEntry>) -> SynchronizationState {
        if self.reindexing.load(Ordering::SeqCst) {
            return SynchronizationState::InitReindex;
        }
        if self.left_ibd.load(Ordering::Relaxed) {
            return SynchronizationState::PostInit;
        }
        match tip {
            Some(tip)
                if tip.chain_work >= self.context.chain_params().minimum_chain_work
                    && tip.header.timestamp as i64 >= self.now() - DEFAULT_MAX_TIP_AGE =>
            {
                info!("Leaving initial block download");
                self.left_ibd.store(true, Ordering::Relaxed);
                SynchronizationState::PostInit
            }
            _ => SynchronizationState::InitDownload,
        }
    }

    /// Work a new header chain needs before its headers are kept
    fn anti_dos_work_threshold(&self) -> U256 {
        let minimum = self.context.chain_params().minimum_chain_work;
        match self.active.read().tip() {
            None => minimum,
            Some(tip) => {
                let buffer = get_block_proof(tip.header.bits).mul_u64(self.options.low_work_buffer as u64);
                let buffer = std::cmp::min(buffer, tip.chain_work);
                std::cmp::max(minimum, tip.chain_work - buffer)
            }
        }
    }

    fn ensure_genesis(&self, cs: &mut ChainState) -> Result<()> {
        let genesis = &self.context.chain_params().genesis;
        let hash = genesis.block_hash();
        if cs.index.get(&hash).map(|e| e.has_data()).unwrap_or(false) {
            return Ok(());
        }
        let entry = cs
            .index
            .insert(genesis.header)
            .ok_or_else(|| ConsensusError::Fatal("block index belongs to a different genesis block".into()))?;
        let pos = self.blocks.write_block(genesis).map_err(|e| self.fatal(e))?;
        cs.index.received_data(&entry, pos);
        cs.dirty.insert(hash);
        self.link_candidates(cs, &entry);
        Ok(())
    }

    /// Whether every block from `entry` back to the active chain is stored
    fn chain_has_data(chain: &Chain, entry: &BlockTreeEntry) -> bool {
        let mut walk = Some(entry);
        while let Some(current) = walk {
            if chain.contains(current) {
                return true;
            }
            if !current.has_data() {
                return false;
            }
            walk = current.parent();
        }
        true
    }

    /// Make `entry` and any stored descendants waiting on it tip candidates,
    /// or park it until its missing ancestor arrives
    fn link_candidates(&self, cs: &mut ChainState, entry: &Arc<BlockTreeEntry>) {
        if !Self::chain_has_data(&self.active.read(), entry) {
            if let Some(parent) = entry.parent() {
                cs.unlinked.entry(parent.hash).or_default().push(Arc::clone(entry));
            }
            return;
        }
        let mut queue = vec![Arc::clone(entry)];
        while let Some(next) = queue.pop() {
            cs.index.add_candidate(&next);
            if let Some(children) = cs.unlinked.remove(&next.hash) {
                queue.extend(children);
            }
        }
    }

    fn rebuild_candidates(&self, cs: &mut ChainState) {
        let chain = self.active.read();
        let tip_work = chain.tip().map(|t| t.chain_work).unwrap_or(U256::ZERO);
        let stored: Vec<Arc<BlockTreeEntry>> = cs
            .index
            .iter()
            .filter(|e| e.has_data() && !e.is_invalid() && e.chain_work >= tip_work)
            .cloned()
            .collect();
        drop(chain);
        for entry in stored {
            self.link_candidates(cs, &entry);
        }
    }

    /// Mark `entry` failed and everything built on it as failed-child
    fn invalid_block_found(&self, cs: &mut ChainState, entry: &Arc<BlockTreeEntry>) {
        warn!("Invalid block found: {} at height {}", entry.hash, entry.height);
        entry.set_invalid(false);
        cs.index.remove_candidate(entry);
        cs.index.invalidate_descendants(entry);
        let failed: Vec<BlockHash> = cs
            .index
            .iter()
            .filter(|e| e.height >= entry.height && e.is_invalid())
            .map(|e| e.hash)
            .collect();
        cs.dirty.extend(failed);
        self.update_warnings(cs);
    }

    fn accept_block_header(
        &self,
        cs: &mut ChainState,
        header: &BlockHeader,
        state: &mut BlockValidationState,
        min_pow_checked: bool,
    ) -> Result<Option<Arc<BlockTreeEntry>>> {
        let params = self.context.chain_params();
        let hash = header.block_hash();
        if let Some(entry) = cs.index.get(&hash) {
            if entry.is_invalid() {
                state.invalid(BlockValidationResult::CachedInvalid, "duplicate-invalid", "block is marked invalid");
                return Ok(None);
            }
            return Ok(Some(Arc::clone(entry)));
        }

        if hash == params.genesis_hash() {
            let entry = cs
                .index
                .insert(*header)
                .ok_or_else(|| ConsensusError::Fatal("genesis header conflicts with the block index".into()))?;
            cs.dirty.insert(hash);
            return Ok(Some(entry));
        }

        if !check_block_header(header, state, params) {
            debug!("Header {} failed checks: {}", hash, state);
            return Ok(None);
        }
        let prev = match cs.index.get(&header.prev_block_hash) {
            Some(prev) => Arc::clone(prev),
            None => {
                state.invalid(
                    BlockValidationResult::MissingPrev,
                    "prev-blk-not-found",
                    &format!("previous block {} not found", header.prev_block_hash),
                );
                return Ok(None);
            }
        };
        if prev.is_invalid() {
            state.invalid(BlockValidationResult::InvalidPrev, "bad-prevblk", "previous block is invalid");
            return Ok(None);
        }
        if !contextual_check_block_header(header, state, &prev, params, self.now()) {
            debug!("Header {} failed contextual checks: {}", hash, state);
            return Ok(None);
        }
        if !min_pow_checked {
            let work = prev.chain_work + get_block_proof(header.bits);
            if work < self.anti_dos_work_threshold() {
                state.invalid(BlockValidationResult::HeaderLowWork, "too-little-chainwork", "");
                return Ok(None);
            }
        }

        let previous_best = cs.index.best_header().map(|b| b.hash);
        let entry = cs
            .index
            .insert(*header)
            .ok_or_else(|| ConsensusError::Fatal(format!("parent of {} vanished from the block index", hash)))?;
        cs.dirty.insert(hash);
        if let Some(best) = cs.index.best_header() {
            if Some(best.hash) != previous_best {
                let tip = self.active.read().tip().cloned();
                self.events.header_tip(self.sync_state(tip.as_deref()), best);
            }
        }
        Ok(Some(entry))
    }

    /// Check a header and add it to the block index
    pub fn process_block_header(&self, header: &BlockHeader) -> Result<BlockValidationState> {
        let mut state = BlockValidationState::new();
        let accepted = {
            let mut cs = self.state.lock();
            self.accept_block_header(&mut cs, header, &mut state, false)
        };
        self.notify();
        accepted?;
        Ok(state)
    }

    /// Validate a full block, store it and move the active chain if it wins
    ///
    /// Rule violations come back in [`ProcessedBlock::state`]. `Err` means
    /// the engine itself failed.
    pub fn process_block(&self, block: Arc<Block>) -> Result<ProcessedBlock> {
        let processed = self.process_block_at(block, None);
        self.notify();
        processed
    }

    fn process_block_at(&self, block: Arc<Block>, known_pos: Option<BlockPos>) -> Result<ProcessedBlock> {
        let mut cs = self.state.lock();
        let events = &self.events;
        let params = self.context.chain_params();
        let hash = block.block_hash();
        let mut state = BlockValidationState::new();
        let rejected = |state: BlockValidationState| ProcessedBlock {
            new_block: false,
            state,
        };

        if !check_block(&block, &mut state, params, true) {
            if state.result() != BlockValidationResult::Mutated {
                if let Some(entry) = cs.index.get(&hash).cloned() {
                    self.invalid_block_found(&mut cs, &entry);
                }
            }
            warn!("Block {} failed checks: {}", hash, state);
            events.block_checked(&block, &state);
            return Ok(rejected(state));
        }

        let entry = match self.accept_block_header(&mut cs, &block.header, &mut state, true)? {
            Some(entry) => entry,
            None => {
                debug!("Block {} rejected: {}", hash, state);
                events.block_checked(&block, &state);
                return Ok(rejected(state));
            }
        };
        if entry.has_data() {
            return Ok(rejected(state));
        }

        if !contextual_check_block(&block, &mut state, entry.parent(), params) {
            if state.result() != BlockValidationResult::Mutated {
                self.invalid_block_found(&mut cs, &entry);
            }
            warn!("Block {} failed contextual checks: {}", hash, state);
            events.block_checked(&block, &state);
            return Ok(rejected(state));
        }

        let pos = match known_pos {
            Some(pos) => pos,
            None => self.blocks.write_block(&block).map_err(|e| self.fatal(e))?,
        };
        cs.index.received_data(&entry, pos);
        cs.dirty.insert(hash);

        let builds_on_tip = self.active.read().tip().map(|t| t.hash) == entry.parent().map(|p| p.hash);
        if builds_on_tip {
            events.pow_valid_block(&block, &entry);
        }

        self.link_candidates(&mut cs, &entry);
        if let Some((failed, failed_state)) = self.activate_best_chain(&mut cs, Some(&block))? {
            if failed == hash {
                state = failed_state;
            }
        }
        self.maybe_flush(&mut cs)?;
        Ok(ProcessedBlock { new_block: true, state })
    }

    /// Connect the most-work valid candidate, reorganizing if needed
    ///
    /// Returns the last block that failed to connect, if any.
    fn activate_best_chain(
        &self,
        cs: &mut ChainState,
        pending: Option<&Arc<Block>>,
    ) -> Result<Option<(BlockHash, BlockValidationState)>> {
        let start_tip = self.active.read().tip().cloned();
        let mut failure = None;
        loop {
            let tip_work = self.active.read().tip().map(|t| t.chain_work);
            let candidate = cs
                .index
                .candidates()
                .into_iter()
                .find(|c| !c.is_invalid() && tip_work.map_or(true, |work| c.chain_work > work));
            let candidate = match candidate {
                Some(candidate) => candidate,
                None => break,
            };
            if let Some(failed) = self.activate_step(cs, &candidate, pending)? {
                failure = Some(failed);
            }
        }

        let tip = self.active.read().tip().cloned();
        if let Some(tip) = tip {
            if start_tip.as_ref().map(|t| t.hash) != Some(tip.hash) {
                cs.index.prune_candidates(&tip.chain_work);
                info!(
                    "New best block {} height {} work {} date {}",
                    tip.hash,
                    tip.height,
                    tip.chain_work,
                    chrono::DateTime::from_timestamp(tip.header.timestamp as i64, 0)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default()
                );
                self.update_warnings(cs);
                let best_height = cs.index.best_header().map(|b| b.height).unwrap_or(tip.height);
                let progress = if best_height == 0 {
                    1.0
                } else {
                    (tip.height as f64 / best_height as f64).min(1.0)
                };
                self.events.block_tip(self.sync_state(Some(&tip)), &tip, progress);
            }
        }
        Ok(failure)
    }

    fn activate_step(
        &self,
        cs: &mut ChainState,
        candidate: &Arc<BlockTreeEntry>,
        pending: Option<&Arc<Block>>,
    ) -> Result<Option<(BlockHash, BlockValidationState)>> {
        let fork = self.active.read().find_fork(candidate).cloned();
        loop {
            let tip = self.active.read().tip().cloned();
            match (tip, &fork) {
                (None, _) => break,
                (Some(tip), Some(fork)) if tip.hash == fork.hash => break,
                _ => self.disconnect_tip(cs)?,
            }
        }

        let start_height = fork.as_ref().map(|f| f.height + 1).unwrap_or(0);
        let mut path = Vec::new();
        let mut walk = Some(Arc::clone(candidate));
        while let Some(entry) = walk {
            if entry.height < start_height {
                break;
            }
            walk = entry.parent_arc().cloned();
            path.push(entry);
        }
        for entry in path.iter().rev() {
            if let Err(state) = self.connect_tip(cs, entry, pending)? {
                return Ok(Some((entry.hash, state)));
            }
        }
        Ok(None)
    }

    fn connect_tip(
        &self,
        cs: &mut ChainState,
        entry: &Arc<BlockTreeEntry>,
        pending: Option<&Arc<Block>>,
    ) -> Result<std::result::Result<(), BlockValidationState>> {
        let block = match pending {
            Some(block) if block.block_hash() == entry.hash => Arc::clone(block),
            _ => self.read_block(entry).map_err(|e| self.fatal(e))?,
        };
        let params = self.context.chain_params();
        let events = &self.events;
        let mut state = BlockValidationState::new();

        let undo = {
            let mut view = CoinsViewCache::new(&mut cs.coins);
            let undo = connect_block(&block, entry, &mut view, params, self.pool.as_ref(), &mut state)
                .map_err(|e| self.fatal(e))?;
            if undo.is_some() {
                view.flush().map_err(|e| self.fatal(e))?;
            }
            undo
        };
        let undo = match undo {
            Some(undo) => undo,
            None => {
                warn!("ConnectBlock {} failed: {}", entry.hash, state);
                events.block_checked(&block, &state);
                self.invalid_block_found(cs, entry);
                return Ok(Err(state));
            }
        };

        if entry.height > 0 && entry.undo_pos().is_none() {
            let data_pos = entry
                .data_pos()
                .ok_or_else(|| self.fatal(ConsensusError::Fatal(format!("block {} has no data", entry.hash))))?;
            let pos = self
                .blocks
                .write_undo(data_pos, &entry.header.prev_block_hash, &undo)
                .map_err(|e| self.fatal(e))?;
            entry.set_undo_pos(pos);
        }
        entry.raise_status(BlockStatus::FullyValid);
        cs.dirty.insert(entry.hash);
        self.active.write().set_tip(Some(Arc::clone(entry)));
        debug!(
            "Connected block {} height {} ({} txs)",
            entry.hash,
            entry.height,
            block.transactions.len()
        );

        events.block_checked(&block, &state);
        events.block_connected(&block, entry);
        Ok(Ok(()))
    }

    fn disconnect_tip(&self, cs: &mut ChainState) -> Result<()> {
        let tip = self
            .active
            .read()
            .tip()
            .cloned()
            .ok_or_else(|| ConsensusError::Fatal("no tip to disconnect".into()))?;
        let parent = tip
            .parent_arc()
            .cloned()
            .ok_or_else(|| self.fatal(ConsensusError::Fatal("cannot disconnect the genesis block".into())))?;
        let block = self.read_block(&tip).map_err(|e| self.fatal(e))?;
        let undo = self.read_spent_outputs(&tip).map_err(|e| self.fatal(e))?;
        {
            let mut view = CoinsViewCache::new(&mut cs.coins);
            match disconnect_block(&block, &tip, &undo, &mut view).map_err(|e| self.fatal(e))? {
                DisconnectResult::Ok => view.flush().map_err(|e| self.fatal(e))?,
                other => {
                    return Err(self.fatal(ConsensusError::Fatal(format!(
                        "failed to disconnect block {}: {:?}",
                        tip.hash, other
                    ))))
                }
            }
        }
        self.active.write().set_tip(Some(parent));
        debug!("Disconnected block {} height {}", tip.hash, tip.height);
        self.events.block_disconnected(&block, &tip);
        Ok(())
    }

    fn update_warnings(&self, cs: &mut ChainState) {
        let tip = self.active.read().tip().cloned();
        let unknown_rules = tip
            .as_ref()
            .map(|tip| self.unknown_rules_active(cs, tip))
            .unwrap_or(false);
        self.set_warning(cs, Warning::UnknownNewRulesActivated, unknown_rules);

        let large_invalid = match (cs.index.best_invalid(), &tip) {
            (Some(invalid), Some(tip)) => {
                let margin = get_block_proof(tip.header.bits).mul_u64(INVALID_CHAIN_WARNING_BLOCKS);
                invalid.chain_work > tip.chain_work + margin
            }
            _ => false,
        };
        self.set_warning(cs, Warning::LargeWorkInvalidChain, large_invalid);
    }

    /// A majority of the last blocks carry unknown version bits, or one
    /// unknown bit reached the lock-in threshold over the last full period
    fn unknown_rules_active(&self, cs: &mut ChainState, tip: &BlockTreeEntry) -> bool {
        let mut unexpected = 0;
        let mut walk = Some(tip);
        for _ in 0..VERSIONBITS_WINDOW {
            match walk {
                Some(entry) => {
                    if unexpected_version(entry.header.version) {
                        unexpected += 1;
                    }
                    walk = entry.parent();
                }
                None => break,
            }
        }
        if unexpected > VERSIONBITS_WINDOW / 2 {
            return true;
        }

        let params = self.context.chain_params();
        let window = params.miner_confirmation_window as u32;
        let period_end_height = match ((tip.height + 1) / window * window).checked_sub(1) {
            Some(height) => height,
            None => return false,
        };
        let period_end = match tip.ancestor(period_end_height) {
            Some(entry) => entry,
            None => return false,
        };
        if let Some(locked_in) = cs.version_bit_periods.get(&period_end.hash) {
            return *locked_in;
        }
        let mut counts = [0usize; 29];
        let mut walk = Some(period_end);
        for _ in 0..window {
            match walk {
                Some(entry) => {
                    let version = entry.header.version;
                    if version & VERSIONBITS_TOP_MASK == VERSIONBITS_TOP_BITS {
                        for (bit, count) in counts.iter_mut().enumerate() {
                            if version & (1 << bit) != 0 {
                                *count += 1;
                            }
                        }
                    }
                    walk = entry.parent();
                }
                None => break,
            }
        }
        let locked_in = counts.iter().any(|c| *c >= params.rule_change_activation_threshold);
        cs.version_bit_periods.insert(period_end.hash, locked_in);
        locked_in
    }

    fn set_warning(&self, cs: &mut ChainState, warning: Warning, active: bool) {
        let events = &self.events;
        if active {
            if cs.warnings.insert(warning) {
                warn!("Warning: {}", warning);
                events.warning_set(warning);
            }
        } else if cs.warnings.remove(&warning) {
            events.warning_unset(warning);
        }
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.state.lock().warnings.iter().copied().collect()
    }

    fn maybe_flush(&self, cs: &mut ChainState) -> Result<()> {
        if cs.coins.memory_usage() > self.options.coins_cache_size {
            debug!("Coins cache at {} bytes, flushing", cs.coins.memory_usage());
            self.flush_locked(cs)?;
        }
        Ok(())
    }

    /// Block files first, then the index pointing into them, then the coins
    /// whose undo data lives in those files
    fn write_state(&self, cs: &mut ChainState) -> Result<()> {
        self.blocks.flush()?;
        let mut batch = WriteBatch::new();
        for hash in &cs.dirty {
            if let Some(entry) = cs.index.get(hash) {
                let record = serde_json::to_vec(&entry.to_record())
                    .map_err(|e| ConsensusError::Serialization(e.to_string()))?;
                batch.put(index_key(hash), record);
            }
        }
        let written = batch.len();
        self.index_db.write_batch(batch)?;
        cs.dirty.clear();
        cs.coins.flush()?;
        debug!("Wrote {} block index entries", written);
        Ok(())
    }

    fn flush_locked(&self, cs: &mut ChainState) -> Result<()> {
        self.write_state(cs).map_err(|err| {
            error!("Failed to flush chainstate: {}", err);
            let err = match err {
                ConsensusError::Storage(_) => err,
                other => ConsensusError::Storage(other.to_string()),
            };
            self.events.flush_error(&err);
            err
        })
    }

    /// Write the block index and the coins cache to their stores
    pub fn flush(&self) -> Result<()> {
        let flushed = {
            let mut cs = self.state.lock();
            self.flush_locked(&mut cs)
        };
        self.notify();
        flushed
    }

    /// Import blocks from external block files, or reindex from the block
    /// store when `paths` is empty
    ///
    /// Blocks may appear before their parents; they are held back until the
    /// parent has been processed. The interrupt flag is checked between
    /// blocks and ends the import with [`ConsensusError::Interrupted`].
    pub fn import_blocks(&self, paths: &[PathBuf]) -> Result<()> {
        let imported = if paths.is_empty() {
            self.reindex()
        } else {
            self.import_files(paths)
        };
        self.notify();
        imported
    }

    fn import_files(&self, paths: &[PathBuf]) -> Result<()> {
        let magic = self.context.chain_params().message_start;
        let mut unlinked = HashMap::new();
        for path in paths {
            let blocks = read_block_file(path, &magic)?;
            info!("Importing {} blocks from {}", blocks.len(), path.display());
            for block in blocks {
                self.import_one(Arc::new(block), None, &mut unlinked)?;
            }
        }
        if !unlinked.is_empty() {
            warn!("{} imported blocks have unknown parents", unlinked.values().map(Vec::len).sum::<usize>());
        }
        self.flush()
    }

    fn import_one(
        &self,
        block: Arc<Block>,
        pos: Option<BlockPos>,
        unlinked: &mut HashMap<BlockHash, Vec<(Arc<Block>, Option<BlockPos>)>>,
    ) -> Result<()> {
        let genesis_hash = self.context.chain_params().genesis_hash();
        let parent_known = block.block_hash() == genesis_hash
            || self.state.lock().index.contains(&block.header.prev_block_hash);
        if !parent_known {
            unlinked
                .entry(block.header.prev_block_hash)
                .or_default()
                .push((block, pos));
            return Ok(());
        }
        let mut queue = vec![(block, pos)];
        while let Some((block, pos)) = queue.pop() {
            if self.context.is_interrupted() {
                info!("Block import interrupted");
                return Err(ConsensusError::Interrupted);
            }
            let hash = block.block_hash();
            let processed = self.process_block_at(block, pos);
            self.notify();
            let processed = processed?;
            if !processed.state.is_valid() {
                debug!("Imported block {} rejected: {}", hash, processed.state);
            }
            if let Some(children) = unlinked.remove(&hash) {
                queue.extend(children);
            }
        }
        Ok(())
    }

    fn reindex(&self) -> Result<()> {
        self.reindexing.store(true, Ordering::SeqCst);
        let _guard = ReindexGuard(&self.reindexing);
        let events = &self.events;
        let positions = self.blocks.block_positions()?;
        info!("Reindexing {} stored blocks", positions.len());
        events.progress("Reindexing blocks", 0, false);

        let total = positions.len().max(1);
        let mut last_percent = 0u8;
        let mut unlinked = HashMap::new();
        for (i, pos) in positions.into_iter().enumerate() {
            let block = self.blocks.read_block(pos)?;
            self.import_one(Arc::new(block), Some(pos), &mut unlinked)?;
            let percent = ((i + 1) * 100 / total) as u8;
            if percent != last_percent {
                last_percent = percent;
                events.progress("Reindexing blocks", percent, false);
            }
        }

        {
            let mut cs = self.state.lock();
            self.ensure_genesis(&mut cs)?;
            self.activate_best_chain(&mut cs, None)?;
        }
        info!("Reindexing finished");
        self.flush()
    }

    pub fn best_header(&self) -> Option<Arc<BlockTreeEntry>> {
        self.state.lock().index.best_header().cloned()
    }

    /// Snapshot of the active chain
    pub fn active_chain(&self) -> Chain {
        self.active.read().clone()
    }

    pub fn tip(&self) -> Option<Arc<BlockTreeEntry>> {
        self.active.read().tip().cloned()
    }

    /// Height of the active tip, -1 before genesis is connected
    pub fn height(&self) -> i64 {
        self.active.read().height()
    }

    pub fn block_tree_entry(&self, hash: &BlockHash) -> Option<Arc<BlockTreeEntry>> {
        self.state.lock().index.get(hash).cloned()
    }

    /// Coin at `outpoint` in the current chainstate
    pub fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        self.state.lock().coins.get_coin(outpoint)
    }

    pub fn read_block(&self, entry: &BlockTreeEntry) -> Result<Arc<Block>> {
        let pos = entry
            .data_pos()
            .ok_or_else(|| ConsensusError::InvalidArgument(format!("block {} is not stored", entry.hash)))?;
        let block = self.blocks.read_block(pos)?;
        if block.block_hash() != entry.hash {
            return Err(ConsensusError::Storage(format!("block at {:?} is not {}", pos, entry.hash)));
        }
        Ok(Arc::new(block))
    }

    /// Coins spent by the block at `entry`, as stored when it was connected
    pub fn read_spent_outputs(&self, entry: &BlockTreeEntry) -> Result<BlockSpentOutputs> {
        if entry.height == 0 {
            return Err(ConsensusError::InvalidArgument("the genesis block spends nothing".into()));
        }
        let pos = entry
            .undo_pos()
            .ok_or_else(|| ConsensusError::InvalidArgument(format!("no undo data for block {}", entry.hash)))?;
        self.blocks.read_undo(pos, &entry.header.prev_block_hash)
    }
}

impl Drop for ChainstateManager {
    fn drop(&mut self) {
        let flushed = {
            let mut cs = self.state.lock();
            self.flush_locked(&mut cs)
        };
        if let Err(err) = flushed {
            error!("Failed to flush chainstate on shutdown: {}", err);
        }
        self.notify();
    }
}
