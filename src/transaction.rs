//! Transaction validity: context-free checks, finality, relative lock times and
//! input checks against the coins being spent

use std::collections::HashSet;

use crate::chain::BlockTreeEntry;
use crate::coins::CoinsView;
use crate::constants::*;
use crate::economic::money_range;
use crate::error::Result;
use crate::serialization::transaction::base_size;
use crate::types::*;
use crate::validation_state::{TxValidationError, TxValidationResult};

pub type TxResult<T> = std::result::Result<T, TxValidationError>;

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// A transaction tx = (v, ins, outs, lt) is valid if and only if:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. 4 · |tx|ₙₒ_𝓌ᵢₜₙₑₛₛ ≤ W_max
/// 3. ∀o ∈ outs: 0 ≤ o.value ≤ M_max, and Σ o.value ≤ M_max
/// 4. no outpoint is spent twice
/// 5. coinbase: 2 ≤ |scriptSig| ≤ 100; otherwise no input spends the null outpoint
pub fn check_transaction(tx: &Transaction) -> TxResult<()> {
    if tx.inputs.is_empty() {
        return Err(TxValidationError::consensus("bad-txns-vin-empty"));
    }
    if tx.outputs.is_empty() {
        return Err(TxValidationError::consensus("bad-txns-vout-empty"));
    }
    if base_size(tx) * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT {
        return Err(TxValidationError::consensus("bad-txns-oversize"));
    }

    let mut value_out: Integer = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Err(TxValidationError::consensus("bad-txns-vout-negative"));
        }
        if output.value > MAX_MONEY {
            return Err(TxValidationError::consensus("bad-txns-vout-toolarge"));
        }
        value_out += output.value;
        if !money_range(value_out) {
            return Err(TxValidationError::consensus("bad-txns-txouttotal-toolarge"));
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(TxValidationError::consensus("bad-txns-inputs-duplicate"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(TxValidationError::consensus("bad-cb-length"));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(TxValidationError::consensus("bad-txns-prevout-null"));
    }
    Ok(())
}

/// IsFinalTx
///
/// Final when the lock time is zero, already passed (as a height below
/// `block_height` or a time below `block_time`), or every input opts out with
/// a final sequence.
pub fn is_final_tx(tx: &Transaction, block_height: u32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let threshold = if tx.lock_time < LOCKTIME_THRESHOLD {
        block_height as i64
    } else {
        block_time
    };
    if (tx.lock_time as i64) < threshold {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Minimum height and time a block must exceed for `tx` to be included
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLocks {
    pub min_height: i64,
    pub min_time: i64,
}

/// CalculateSequenceLocks (BIP68)
///
/// `prev_heights[i]` is the height of the coin spent by input i; entries of
/// inputs that opt out are zeroed. `entry` is the block the transaction is in.
pub fn calculate_sequence_locks(
    tx: &Transaction,
    enforce: bool,
    prev_heights: &mut [u32],
    entry: &BlockTreeEntry,
) -> SequenceLocks {
    let mut locks = SequenceLocks {
        min_height: -1,
        min_time: -1,
    };
    if !enforce || tx.version < 2 {
        return locks;
    }
    for (input, prev_height) in tx.inputs.iter().zip(prev_heights.iter_mut()) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            *prev_height = 0;
            continue;
        }
        let coin_height = *prev_height;
        let value = (input.sequence & SEQUENCE_LOCKTIME_MASK) as i64;
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let coin_time = entry
                .ancestor(coin_height.saturating_sub(1))
                .map(|ancestor| ancestor.median_time_past())
                .unwrap_or(0);
            locks.min_time = locks
                .min_time
                .max(coin_time + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1);
        } else {
            locks.min_height = locks.min_height.max(coin_height as i64 + value - 1);
        }
    }
    locks
}

/// EvaluateSequenceLocks: both locks must lie strictly before the block
pub fn evaluate_sequence_locks(entry: &BlockTreeEntry, locks: SequenceLocks) -> bool {
    let block_time = entry.parent().map(|p| p.median_time_past()).unwrap_or(0);
    locks.min_height < entry.height as i64 && locks.min_time < block_time
}

/// Coins spent by `tx`, in input order; `None` if any is missing
pub fn spent_coins<V: CoinsView + ?Sized>(tx: &Transaction, view: &V) -> Result<Option<Vec<Coin>>> {
    let mut coins = Vec::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        match view.get_coin(&input.prevout)? {
            Some(coin) => coins.push(coin),
            None => return Ok(None),
        }
    }
    Ok(Some(coins))
}

/// CheckTxInputs: 𝒯𝒳 × 𝒞* × ℕ → ℤ
///
/// For a transaction spending `coins` in a block at `spend_height`:
/// 1. coinbase coins need `maturity` confirmations
/// 2. Σ coin values and each value lie in the money range
/// 3. Σ inputs ≥ Σ outputs
///
/// Returns the fee.
pub fn check_tx_inputs(tx: &Transaction, coins: &[Coin], spend_height: u32, maturity: u32) -> TxResult<Integer> {
    let mut value_in: Integer = 0;
    for coin in coins {
        if coin.is_coinbase && spend_height.saturating_sub(coin.height) < maturity {
            return Err(TxValidationError::new(
                TxValidationResult::PrematureSpend,
                "bad-txns-premature-spend-of-coinbase",
                &format!("tried to spend coinbase at depth {}", spend_height.saturating_sub(coin.height)),
            ));
        }
        if !money_range(coin.output.value) {
            return Err(TxValidationError::consensus("bad-txns-inputvalues-outofrange"));
        }
        value_in += coin.output.value;
        if !money_range(value_in) {
            return Err(TxValidationError::consensus("bad-txns-inputvalues-outofrange"));
        }
    }

    let value_out = tx.total_output_value().unwrap_or(Integer::MAX);
    if value_in < value_out {
        return Err(TxValidationError::new(
            TxValidationResult::Consensus,
            "bad-txns-in-belowout",
            &format!("value in ({}) < value out ({})", value_in, value_out),
        ));
    }
    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(TxValidationError::consensus("bad-txns-fee-outofrange"));
    }
    Ok(fee)
}
