//! Regtest chain building shared by the integration tests

#![allow(dead_code)]

use aureus_kernel::constants::{COIN, SEQUENCE_FINAL, VERSIONBITS_TOP_BITS};
use aureus_kernel::hashes::block_merkle_root;
use aureus_kernel::opcodes::{OP_0, OP_TRUE};
use aureus_kernel::pow::check_proof_of_work;
use aureus_kernel::script::ScriptBuilder;
use aureus_kernel::*;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Checked(BlockHash, bool),
    PowValid(BlockHash),
    Connected(BlockHash),
    Disconnected(BlockHash),
    Tip(u32),
    HeaderTip(u32),
    WarningSet(Warning),
    WarningUnset(Warning),
    FlushError,
    FatalError,
}

/// Records every callback in arrival order
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn connected(&self) -> Vec<BlockHash> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Connected(hash) => Some(*hash),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl KernelNotifications for Recorder {
    fn block_tip(&self, _state: SynchronizationState, entry: &Arc<BlockTreeEntry>, _progress: f64) {
        self.push(Event::Tip(entry.height));
    }

    fn header_tip(&self, _state: SynchronizationState, height: u32, _timestamp: i64, _presync: bool) {
        self.push(Event::HeaderTip(height));
    }

    fn warning_set(&self, warning: Warning, _message: &str) {
        self.push(Event::WarningSet(warning));
    }

    fn warning_unset(&self, warning: Warning) {
        self.push(Event::WarningUnset(warning));
    }

    fn flush_error(&self, _error: &ConsensusError) {
        self.push(Event::FlushError);
    }

    fn fatal_error(&self, _error: &ConsensusError) {
        self.push(Event::FatalError);
    }
}

impl ValidationInterface for Recorder {
    fn block_checked(&self, block: &Arc<Block>, state: &BlockValidationState) {
        self.push(Event::Checked(block.block_hash(), state.is_valid()));
    }

    fn pow_valid_block(&self, block: &Arc<Block>, _entry: &Arc<BlockTreeEntry>) {
        self.push(Event::PowValid(block.block_hash()));
    }

    fn block_connected(&self, _block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {
        self.push(Event::Connected(entry.hash));
    }

    fn block_disconnected(&self, _block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {
        self.push(Event::Disconnected(entry.hash));
    }
}

pub fn regtest_context(recorder: &Arc<Recorder>) -> Arc<Context> {
    Context::new(
        ContextOptions::new()
            .chain_type(ChainType::Regtest)
            .notifications(recorder.clone())
            .validation_interface(recorder.clone()),
    )
}

pub fn in_memory_options() -> ChainstateManagerOptions {
    let mut options = ChainstateManagerOptions::new("/nonexistent", "/nonexistent/blocks");
    options.set_block_tree_db_in_memory(true);
    options.set_chainstate_db_in_memory(true);
    options
}

pub fn on_disk_options(dir: &Path) -> ChainstateManagerOptions {
    ChainstateManagerOptions::new(dir, dir.join("blocks"))
}

/// In-memory regtest manager with a recorder subscribed to everything
pub fn regtest_manager() -> (ChainstateManager, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let manager = ChainstateManager::new(regtest_context(&recorder), in_memory_options()).unwrap();
    recorder.take();
    (manager, recorder)
}

/// Coinbase paying `value` to OP_TRUE; `tag` tells apart coinbases of
/// competing blocks at the same height
pub fn coinbase(height: u32, value: i64, tag: u8) -> Transaction {
    Transaction {
        version: 2,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig: ScriptBuilder::new()
                .push_int(height as i64)
                .push_slice(&[tag])
                .push_opcode(OP_0)
                .into_bytes(),
            sequence: SEQUENCE_FINAL,
            witness: vec![],
        }],
        outputs: vec![TransactionOutput {
            value,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    }
}

/// Spend output 0 of `prev` into a single OP_TRUE output
pub fn spend(prev: &Transaction, value: i64) -> Transaction {
    Transaction {
        version: 2,
        inputs: vec![TransactionInput {
            prevout: OutPoint::new(prev.txid(), 0),
            script_sig: vec![],
            sequence: SEQUENCE_FINAL,
            witness: vec![],
        }],
        outputs: vec![TransactionOutput {
            value,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    }
}

/// Solve a regtest block on top of `prev`
pub fn mine(prev: &BlockTreeEntry, txs: Vec<Transaction>) -> Arc<Block> {
    let params = ChainParams::regtest();
    let mut block = Block {
        header: BlockHeader {
            version: VERSIONBITS_TOP_BITS,
            prev_block_hash: prev.hash,
            merkle_root: [0; 32],
            timestamp: prev.header.timestamp + 1,
            bits: prev.header.bits,
            nonce: 0,
        },
        transactions: txs.into_iter().map(Arc::new).collect(),
    };
    block.header.merkle_root = block_merkle_root(&block).0;
    while !check_proof_of_work(&block.header.block_hash(), block.header.bits, &params.pow_limit) {
        block.header.nonce += 1;
    }
    Arc::new(block)
}

/// Grind the nonce until `header` meets its own target
pub fn solve(mut header: BlockHeader) -> BlockHeader {
    let params = ChainParams::regtest();
    while !check_proof_of_work(&header.block_hash(), header.bits, &params.pow_limit) {
        header.nonce += 1;
    }
    header
}

/// A header on `prev` whose hash misses its target
pub fn unsolved_header(prev: &BlockTreeEntry) -> BlockHeader {
    let params = ChainParams::regtest();
    let mut header = mine(prev, vec![coinbase(prev.height + 1, 50 * COIN, 0)]).header;
    while check_proof_of_work(&header.block_hash(), header.bits, &params.pow_limit) {
        header.nonce += 1;
    }
    header
}

/// Mine and process a block with only a coinbase; returns its coinbase
pub fn extend(manager: &ChainstateManager, tag: u8) -> (Arc<Block>, Transaction) {
    let tip = manager.tip().unwrap();
    let cb = coinbase(tip.height + 1, 50 * COIN, tag);
    let block = mine(&tip, vec![cb.clone()]);
    let processed = manager.process_block(block.clone()).unwrap();
    assert!(processed.state.is_valid(), "{}", processed.state);
    (block, cb)
}

/// Mine `blocks` on top of `prev` without processing them
pub fn branch(prev: &Arc<BlockTreeEntry>, count: usize, tag: u8) -> Vec<Arc<Block>> {
    let mut blocks = Vec::new();
    let mut tip = Arc::clone(prev);
    for _ in 0..count {
        let block = mine(&tip, vec![coinbase(tip.height + 1, 50 * COIN, tag)]);
        tip = BlockTreeEntry::extend(&tip, block.header);
        blocks.push(block);
    }
    blocks
}
