//! Monetary policy: subsidy schedule, money range and fees

use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::types::*;

/// GetBlockSubsidy: ℕ × ℕ → ℤ
///
/// subsidy = 50 · C · 2^(−⌊h/H⌋), zero from the 64th halving on.
///
/// The halving interval H is a chain parameter (regtest uses 150).
pub fn get_block_subsidy(height: u32, halving_interval: u32) -> Integer {
    if halving_interval == 0 {
        return INITIAL_SUBSIDY;
    }
    let halvings = height / halving_interval;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// TotalSupply: ℕ × ℕ → ℤ
///
/// Sum of all subsidies from genesis up to and including `height`, computed per
/// halving era.
pub fn total_supply(height: u32, halving_interval: u32) -> Integer {
    if halving_interval == 0 {
        return INITIAL_SUBSIDY.saturating_mul(height as i64 + 1);
    }
    let mut total = 0i64;
    let mut era_start: u64 = 0;
    let end = height as u64 + 1;
    while era_start < end {
        let era_end = (era_start + halving_interval as u64).min(end);
        let subsidy = get_block_subsidy(era_start as u32, halving_interval);
        if subsidy == 0 {
            break;
        }
        total += subsidy * (era_end - era_start) as i64;
        era_start = era_end;
    }
    total
}

/// MoneyRange: ℤ → 𝔹
pub fn money_range(value: Integer) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Fee of a transaction given the value of the coins it spends
///
/// Fails when the inputs are out of range or do not cover the outputs.
pub fn calculate_fee(tx: &Transaction, value_in: Integer) -> Result<Integer> {
    if tx.is_coinbase() {
        return Ok(0);
    }
    if !money_range(value_in) {
        return Err(ConsensusError::ConsensusRuleViolation(
            "bad-txns-inputvalues-outofrange".to_string(),
        ));
    }
    let value_out = tx
        .total_output_value()
        .filter(|v| money_range(*v))
        .ok_or_else(|| ConsensusError::ConsensusRuleViolation("bad-txns-txouttotal-toolarge".to_string()))?;
    if value_in < value_out {
        return Err(ConsensusError::ConsensusRuleViolation(
            "bad-txns-in-belowout".to_string(),
        ));
    }
    Ok(value_in - value_out)
}
