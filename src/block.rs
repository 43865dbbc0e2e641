//! Block validation: context-free checks, contextual header and body checks,
//! script flag selection and connecting or disconnecting a block against a
//! coins view

use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chain::BlockTreeEntry;
use crate::chainparams::ChainParams;
use crate::coins::{CoinsView, CoinsViewCache};
use crate::constants::*;
use crate::economic::{get_block_subsidy, money_range};
use crate::error::{ConsensusError, Result};
use crate::hashes::block_merkle_root;
use crate::pow::{check_proof_of_work, get_next_work_required};
use crate::script::{is_unspendable, verify_script, ScriptBuilder, ScriptError, VerificationFlags};
use crate::segwit::{block_weight, check_witness_commitment};
use crate::serialization::block::block_base_size;
use crate::sighash::PrecomputedTransactionData;
use crate::signature::TransactionSignatureChecker;
use crate::sigop::{legacy_sigop_count, transaction_sigop_cost};
use crate::transaction::{
    calculate_sequence_locks, check_transaction, check_tx_inputs, evaluate_sequence_locks, is_final_tx, spent_coins,
};
use crate::types::*;
use crate::validation_state::{BlockValidationResult, BlockValidationState};

/// Testnet4: a retarget block may not be more than this far before its parent
pub const MAX_TIMEWARP: i64 = 600;

/// Height from which BIP34 no longer implies BIP30
const BIP34_IMPLIES_BIP30_LIMIT: u32 = 1_983_702;

/// The two mainnet blocks whose coinbases duplicate earlier ones
const BIP30_REPEATS: [(u32, &str); 2] = [
    (91_842, "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
    (91_880, "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
];

/// CheckBlockHeader: ℋ → {valid, invalid}
///
/// The header hash must meet the target its own bits claim.
pub fn check_block_header(header: &BlockHeader, state: &mut BlockValidationState, params: &ChainParams) -> bool {
    if !check_proof_of_work(&header.block_hash(), header.bits, &params.pow_limit) {
        return state.invalid(BlockValidationResult::InvalidHeader, "high-hash", "proof of work failed");
    }
    true
}

/// CheckBlock: ℬ → {valid, invalid}
///
/// 1. The header passes CheckBlockHeader
/// 2. The merkle root matches and no subtree is duplicated
/// 3. 0 < |txs| and the block without witness fits the weight limit
/// 4. txs[0] is the only coinbase
/// 5. Every transaction passes CheckTransaction
/// 6. Legacy sigops stay within the block limit
pub fn check_block(block: &Block, state: &mut BlockValidationState, params: &ChainParams, check_pow: bool) -> bool {
    if check_pow && !check_block_header(&block.header, state, params) {
        return false;
    }

    let (root, mutated) = block_merkle_root(block);
    if root != block.header.merkle_root {
        return state.invalid(BlockValidationResult::Mutated, "bad-txnmrklroot", "hashMerkleRoot mismatch");
    }
    if mutated {
        return state.invalid(BlockValidationResult::Mutated, "bad-txns-duplicate", "duplicate transaction");
    }

    if block.transactions.is_empty()
        || block.transactions.len() * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT
        || block_base_size(block) * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT
    {
        return state.invalid(BlockValidationResult::Consensus, "bad-blk-length", "size limits failed");
    }

    if !block.transactions[0].is_coinbase() {
        return state.invalid(BlockValidationResult::Consensus, "bad-cb-missing", "first tx is not coinbase");
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return state.invalid(BlockValidationResult::Consensus, "bad-cb-multiple", "more than one coinbase");
    }

    for tx in &block.transactions {
        if let Err(err) = check_transaction(tx) {
            return state.invalid(
                BlockValidationResult::Consensus,
                &err.reject_reason,
                &format!("Transaction check failed (tx hash {}) {}", tx.txid(), err.debug_message),
            );
        }
    }

    let sigops: usize = block.transactions.iter().map(|tx| legacy_sigop_count(tx)).sum();
    if sigops * WITNESS_SCALE_FACTOR > MAX_BLOCK_SIGOPS_COST {
        return state.invalid(BlockValidationResult::Consensus, "bad-blk-sigops", "out-of-bounds SigOpCount");
    }
    true
}

/// ContextualCheckBlockHeader
///
/// Checks against the parent: expected difficulty bits, time above the
/// median-time-past, the testnet4 timewarp rule, time not too far in the
/// future of `now`, and version numbers retired by buried deployments.
pub fn contextual_check_block_header(
    header: &BlockHeader,
    state: &mut BlockValidationState,
    prev: &BlockTreeEntry,
    params: &ChainParams,
    now: i64,
) -> bool {
    let height = prev.height + 1;

    if header.bits != get_next_work_required(prev, header, params) {
        return state.invalid(BlockValidationResult::InvalidHeader, "bad-diffbits", "incorrect proof of work");
    }

    if header.timestamp as i64 <= prev.median_time_past() {
        return state.invalid(BlockValidationResult::InvalidHeader, "time-too-old", "block's timestamp is too early");
    }

    if params.enforce_bip94
        && height as i64 % params.difficulty_adjustment_interval() == 0
        && (header.timestamp as i64) < prev.header.timestamp as i64 - MAX_TIMEWARP
    {
        return state.invalid(
            BlockValidationResult::InvalidHeader,
            "time-timewarp-attack",
            "block's timestamp is too early on diff adjustment block",
        );
    }

    if header.timestamp as i64 > now + MAX_FUTURE_BLOCK_TIME {
        return state.invalid(
            BlockValidationResult::TimeFuture,
            "time-too-new",
            "block timestamp too far in the future",
        );
    }

    let deployments = &params.deployments;
    if (header.version < 2 && height >= deployments.bip34)
        || (header.version < 3 && height >= deployments.bip66)
        || (header.version < 4 && height >= deployments.bip65)
    {
        return state.invalid(
            BlockValidationResult::InvalidHeader,
            &format!("bad-version(0x{:08x})", header.version),
            "rejected nVersion block",
        );
    }
    true
}

/// ContextualCheckBlock
///
/// 1. Every transaction is final at the block's height and lock-time cutoff
///    (the parent's median-time-past once CSV is active)
/// 2. From BIP34 the coinbase scriptSig starts with the height
/// 3. The witness commitment matches, or no transaction has a witness
/// 4. The block weight is within the limit
pub fn contextual_check_block(
    block: &Block,
    state: &mut BlockValidationState,
    prev: Option<&BlockTreeEntry>,
    params: &ChainParams,
) -> bool {
    let height = prev.map(|p| p.height + 1).unwrap_or(0);
    let deployments = &params.deployments;

    let lock_time_cutoff = match prev {
        Some(prev) if height >= deployments.csv => prev.median_time_past(),
        _ => block.header.timestamp as i64,
    };
    if block
        .transactions
        .iter()
        .any(|tx| !is_final_tx(tx, height, lock_time_cutoff))
    {
        return state.invalid(BlockValidationResult::Consensus, "bad-txns-nonfinal", "non-final transaction");
    }

    if height >= deployments.bip34 {
        let expected = ScriptBuilder::new().push_int(height as i64).into_bytes();
        let script_sig = &block.transactions[0].inputs[0].script_sig;
        if !script_sig.starts_with(&expected) {
            return state.invalid(
                BlockValidationResult::Consensus,
                "bad-cb-height",
                "block height mismatch in coinbase",
            );
        }
    }

    let witness_check = if height >= deployments.segwit {
        check_witness_commitment(block)
    } else if block.transactions.iter().any(|tx| tx.has_witness()) {
        Err("unexpected-witness")
    } else {
        Ok(())
    };
    if let Err(reason) = witness_check {
        return state.invalid(BlockValidationResult::Mutated, reason, "witness commitment check failed");
    }

    if block_weight(block) > MAX_BLOCK_WEIGHT {
        return state.invalid(BlockValidationResult::Consensus, "bad-blk-weight", "weight limit failed");
    }
    true
}

/// Script verification flags for the block at `entry`
///
/// P2SH and WITNESS apply everywhere except listed exception blocks; the
/// remaining flags follow the deployment heights.
pub fn get_block_script_flags(entry: &BlockTreeEntry, params: &ChainParams) -> VerificationFlags {
    if let Some(flags) = params.script_flag_exceptions.get(&entry.hash) {
        return *flags;
    }
    let deployments = &params.deployments;
    let mut flags = VerificationFlags::P2SH | VerificationFlags::WITNESS;
    if entry.height >= deployments.taproot {
        flags |= VerificationFlags::TAPROOT;
    }
    if entry.height >= deployments.bip66 {
        flags |= VerificationFlags::DERSIG;
    }
    if entry.height >= deployments.bip65 {
        flags |= VerificationFlags::CHECKLOCKTIMEVERIFY;
    }
    if entry.height >= deployments.csv {
        flags |= VerificationFlags::CHECKSEQUENCEVERIFY;
    }
    if entry.height >= deployments.segwit {
        flags |= VerificationFlags::NULLDUMMY;
    }
    flags
}

/// One input's script to verify, self-contained so it can move to a worker
pub struct ScriptCheck {
    tx: Arc<Transaction>,
    input_index: usize,
    spent: TransactionOutput,
    txdata: Arc<PrecomputedTransactionData>,
    flags: VerificationFlags,
}

impl ScriptCheck {
    pub fn run(&self) -> std::result::Result<(), ScriptError> {
        let input = &self.tx.inputs[self.input_index];
        let checker = TransactionSignatureChecker::new(&self.tx, self.input_index, self.spent.value, &self.txdata);
        verify_script(
            &input.script_sig,
            &self.spent.script_pubkey,
            &input.witness,
            self.flags,
            &checker,
        )
    }
}

/// Run all checks, on `pool` when given; reports one failure if any fail
pub fn run_script_checks(
    checks: &[ScriptCheck],
    pool: Option<&ThreadPool>,
) -> std::result::Result<(), (Txid, usize, ScriptError)> {
    let failure = |check: &ScriptCheck| {
        check
            .run()
            .err()
            .map(|err| (check.tx.txid(), check.input_index, err))
    };
    let found = match pool {
        Some(pool) => pool.install(|| checks.par_iter().find_map_any(failure)),
        None => checks.iter().find_map(failure),
    };
    match found {
        Some(failed) => Err(failed),
        None => Ok(()),
    }
}

fn is_bip30_repeat(entry: &BlockTreeEntry) -> bool {
    BIP30_REPEATS
        .iter()
        .any(|(height, hash)| entry.height == *height && entry.hash.to_string() == *hash)
}

/// ConnectBlock: ℬ × 𝒰𝒮 × ℕ → {valid, invalid} × 𝒰𝒮 × undo
///
/// For block b at `entry` on top of the chain state in `view`:
/// 1. No output may overwrite an unspent coin (BIP30)
/// 2. Every input exists, is mature and the values balance (CheckTxInputs)
/// 3. Relative lock times are met (BIP68) and sig-op cost stays in bounds
/// 4. The coinbase claims at most subsidy plus fees
/// 5. Every input script verifies under the block's flags
///
/// On success `view` holds the new state and the spent coins are returned as
/// undo data. A rule violation returns `Ok(None)` with `state` filled in; `view`
/// is then in an unspecified state and must be discarded.
pub fn connect_block<B: CoinsView>(
    block: &Block,
    entry: &BlockTreeEntry,
    view: &mut CoinsViewCache<B>,
    params: &ChainParams,
    pool: Option<&ThreadPool>,
    state: &mut BlockValidationState,
) -> Result<Option<BlockSpentOutputs>> {
    let expected_prev = entry.parent().map(|p| p.hash);
    if view.best_block()? != expected_prev {
        return Err(ConsensusError::Fatal(format!(
            "coins view is not at the parent of block {}",
            entry.hash
        )));
    }

    // the genesis outputs are never spendable
    if entry.hash == params.genesis_hash() {
        view.set_best_block(entry.hash);
        return Ok(Some(BlockSpentOutputs::default()));
    }

    let height = entry.height;
    let enforce_bip30 = (!is_bip30_repeat(entry) && height < params.deployments.bip34)
        || height >= BIP34_IMPLIES_BIP30_LIMIT;
    if enforce_bip30 {
        for tx in &block.transactions {
            let txid = tx.txid();
            for index in 0..tx.outputs.len() {
                if view.have_coin(&OutPoint::new(txid, index as u32))? {
                    state.invalid(BlockValidationResult::Consensus, "bad-txns-BIP30", "tried to overwrite transaction");
                    return Ok(None);
                }
            }
        }
    }

    let flags = get_block_script_flags(entry, params);
    let enforce_bip68 = height >= params.deployments.csv;

    let mut fees: Integer = 0;
    let mut sigop_cost = 0usize;
    let mut checks = Vec::new();
    let mut undo = BlockSpentOutputs::default();

    for tx in &block.transactions {
        let mut spent_outputs = Vec::new();
        if !tx.is_coinbase() {
            let coins = match spent_coins(tx.as_ref(), &*view)? {
                Some(coins) => coins,
                None => {
                    state.invalid(
                        BlockValidationResult::Consensus,
                        "bad-txns-inputs-missingorspent",
                        &format!("CheckTxInputs: inputs missing/spent in {}", tx.txid()),
                    );
                    return Ok(None);
                }
            };
            let fee = match check_tx_inputs(tx, &coins, height, params.coinbase_maturity) {
                Ok(fee) => fee,
                Err(err) => {
                    state.invalid(
                        BlockValidationResult::Consensus,
                        &err.reject_reason,
                        &format!("{} in {}", err.debug_message, tx.txid()),
                    );
                    return Ok(None);
                }
            };
            fees += fee;
            if !money_range(fees) {
                state.invalid(
                    BlockValidationResult::Consensus,
                    "bad-txns-accumulated-fee-outofrange",
                    "accumulated fee in the block out of range",
                );
                return Ok(None);
            }

            let mut prev_heights: Vec<u32> = coins.iter().map(|coin| coin.height).collect();
            let locks = calculate_sequence_locks(tx, enforce_bip68, &mut prev_heights, entry);
            if !evaluate_sequence_locks(entry, locks) {
                state.invalid(
                    BlockValidationResult::Consensus,
                    "bad-txns-nonfinal",
                    "contains a non-BIP68-final transaction",
                );
                return Ok(None);
            }
            spent_outputs = coins.iter().map(|coin| coin.output.clone()).collect();
        }

        sigop_cost += transaction_sigop_cost(tx, &spent_outputs, flags);
        if sigop_cost > MAX_BLOCK_SIGOPS_COST {
            state.invalid(BlockValidationResult::Consensus, "bad-blk-sigops", "too many sigops");
            return Ok(None);
        }

        if !tx.is_coinbase() {
            let txdata = Arc::new(PrecomputedTransactionData::new(tx, spent_outputs.clone())?);
            for (input_index, spent) in spent_outputs.into_iter().enumerate() {
                checks.push(ScriptCheck {
                    tx: Arc::clone(tx),
                    input_index,
                    spent,
                    txdata: Arc::clone(&txdata),
                    flags,
                });
            }
        }
        let spent = view
            .apply_transaction(tx, height)
            .map_err(|e| ConsensusError::Fatal(format!("coins of {} changed while connecting: {}", tx.txid(), e)))?;
        if !tx.is_coinbase() {
            undo.transactions.push(TransactionSpentOutputs { coins: spent });
        }
    }

    let block_reward = fees + get_block_subsidy(height, params.subsidy_halving_interval);
    let coinbase_out = block.transactions[0].total_output_value().unwrap_or(Integer::MAX);
    if coinbase_out > block_reward {
        state.invalid(
            BlockValidationResult::Consensus,
            "bad-cb-amount",
            &format!("coinbase pays too much (actual={} vs limit={})", coinbase_out, block_reward),
        );
        return Ok(None);
    }

    if let Err((txid, input_index, err)) = run_script_checks(&checks, pool) {
        state.invalid(
            BlockValidationResult::Consensus,
            &format!("mandatory-script-verify-flag-failed ({})", err),
            &format!("input {} of {}", input_index, txid),
        );
        return Ok(None);
    }

    debug!(
        "connected block {} at height {}: {} txs, {} inputs checked",
        entry.hash,
        height,
        block.transactions.len(),
        checks.len()
    );
    view.set_best_block(entry.hash);
    Ok(Some(undo))
}

/// Outcome of undoing a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    Ok,
    /// Undone, but the coins did not look exactly as expected
    Unclean,
    /// The undo data does not fit the block
    Failed,
}

/// DisconnectBlock
///
/// Walks the transactions backwards, removing their outputs and restoring the
/// coins their inputs spent from `undo`.
pub fn disconnect_block<B: CoinsView>(
    block: &Block,
    entry: &BlockTreeEntry,
    undo: &BlockSpentOutputs,
    view: &mut CoinsViewCache<B>,
) -> Result<DisconnectResult> {
    let non_coinbase = block.transactions.len().saturating_sub(1);
    if undo.count() != non_coinbase {
        warn!("block {} and its undo data are inconsistent", entry.hash);
        return Ok(DisconnectResult::Failed);
    }

    let mut clean = true;
    for (i, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        for (index, output) in tx.outputs.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            let outpoint = OutPoint::new(txid, index as u32);
            match view.spend_coin(&outpoint)? {
                Some(coin) if coin.output == *output && coin.height == entry.height && coin.is_coinbase == tx.is_coinbase() => {}
                _ => clean = false,
            }
        }

        if i > 0 {
            let tx_undo = &undo.transactions[i - 1];
            if tx_undo.coins.len() != tx.inputs.len() {
                warn!("transaction {} and its undo data are inconsistent", txid);
                return Ok(DisconnectResult::Failed);
            }
            for (input, coin) in tx.inputs.iter().zip(&tx_undo.coins).rev() {
                if view.have_coin(&input.prevout)? {
                    clean = false;
                }
                view.add_coin(input.prevout, coin.clone(), true)?;
            }
        }
    }

    if let Some(parent) = entry.parent() {
        view.set_best_block(parent.hash);
    }
    Ok(if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    })
}
