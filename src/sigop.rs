//! Signature operation counting

use crate::constants::WITNESS_SCALE_FACTOR;
use crate::opcodes::*;
use crate::script::{instructions, is_p2sh, is_push_only, VerificationFlags};
use crate::segwit::witness_program;
use crate::types::*;

/// GetSigOpCount: 𝕊 × 𝔹 → ℕ
///
/// CHECKSIG counts 1. CHECKMULTISIG counts 20, or with `accurate` the key
/// count pushed right before it when that is OP_1..OP_16.
pub fn count_sigops(script: &[u8], accurate: bool) -> usize {
    let mut count = 0;
    let mut last_opcode = OP_INVALIDOPCODE;
    for op in instructions(script) {
        let opcode = match op {
            Ok((opcode, _)) => opcode,
            Err(_) => break,
        };
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match decode_small_int(last_opcode) {
                    Some(n) if accurate && n > 0 => n as usize,
                    _ => MAX_MULTISIG_SIGOPS,
                };
            }
            _ => {}
        }
        last_opcode = opcode;
    }
    count
}

const MAX_MULTISIG_SIGOPS: usize = 20;

/// Sigops of a P2SH redeem script: the last push of the scriptSig, counted accurately
pub fn count_p2sh_sigops(script_sig: &[u8]) -> usize {
    let mut last_push: &[u8] = &[];
    for op in instructions(script_sig) {
        match op {
            Ok((opcode, data)) if opcode <= OP_16 => last_push = data,
            _ => return 0,
        }
    }
    count_sigops(last_push, true)
}

fn witness_program_sigops(version: u8, program: &[u8], witness: &Witness) -> usize {
    if version != 0 {
        return 0;
    }
    match program.len() {
        20 => 1,
        32 => witness.last().map(|script| count_sigops(script, true)).unwrap_or(0),
        _ => 0,
    }
}

/// Witness sigops of one input, native or P2SH-wrapped
pub fn count_witness_sigops(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &Witness,
    flags: VerificationFlags,
) -> usize {
    if !flags.contains(VerificationFlags::WITNESS) {
        return 0;
    }
    if let Some((version, program)) = witness_program(script_pubkey) {
        return witness_program_sigops(version, program, witness);
    }
    if is_p2sh(script_pubkey) && is_push_only(script_sig) {
        let redeem = instructions(script_sig)
            .filter_map(|op| op.ok())
            .last()
            .map(|(_, data)| data)
            .unwrap_or(&[]);
        if let Some((version, program)) = witness_program(redeem) {
            return witness_program_sigops(version, program, witness);
        }
    }
    0
}

/// Legacy sigops of all scriptSigs and scriptPubKeys of a transaction
pub fn legacy_sigop_count(tx: &Transaction) -> usize {
    let inputs: usize = tx.inputs.iter().map(|i| count_sigops(&i.script_sig, false)).sum();
    let outputs: usize = tx.outputs.iter().map(|o| count_sigops(&o.script_pubkey, false)).sum();
    inputs + outputs
}

/// GetTransactionSigOpCost
///
/// Legacy sigops scaled by 4, plus P2SH sigops scaled by 4, plus witness
/// sigops. `spent` holds the output spent by each input.
pub fn transaction_sigop_cost(tx: &Transaction, spent: &[TransactionOutput], flags: VerificationFlags) -> usize {
    let mut cost = legacy_sigop_count(tx) * WITNESS_SCALE_FACTOR;
    if tx.is_coinbase() {
        return cost;
    }
    if flags.contains(VerificationFlags::P2SH) {
        for (input, prev) in tx.inputs.iter().zip(spent) {
            if is_p2sh(&prev.script_pubkey) {
                cost += count_p2sh_sigops(&input.script_sig) * WITNESS_SCALE_FACTOR;
            }
        }
    }
    for (input, prev) in tx.inputs.iter().zip(spent) {
        cost += count_witness_sigops(&input.script_sig, &prev.script_pubkey, &input.witness, flags);
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptBuilder;

    #[test]
    fn test_count_checksig() {
        assert_eq!(count_sigops(&[OP_CHECKSIG, OP_CHECKSIGVERIFY], false), 2);
    }

    #[test]
    fn test_multisig_accurate_vs_legacy() {
        let script = [OP_1, OP_3, OP_CHECKMULTISIG];
        assert_eq!(count_sigops(&script, false), 20);
        assert_eq!(count_sigops(&script, true), 3);
        assert_eq!(count_sigops(&[OP_CHECKMULTISIG], true), 20);
    }

    #[test]
    fn test_p2sh_sigops() {
        let redeem = [OP_2, OP_CHECKMULTISIG];
        let script_sig = ScriptBuilder::new().push_int(0).push_slice(&redeem).into_bytes();
        assert_eq!(count_p2sh_sigops(&script_sig), 2);
        assert_eq!(count_p2sh_sigops(&[OP_NOP]), 0);
    }

    #[test]
    fn test_witness_sigops() {
        let mut p2wpkh = vec![OP_0, 0x14];
        p2wpkh.extend_from_slice(&[0u8; 20]);
        let flags = VerificationFlags::P2SH | VerificationFlags::WITNESS;
        assert_eq!(count_witness_sigops(&[], &p2wpkh, &vec![], flags), 1);
        assert_eq!(count_witness_sigops(&[], &p2wpkh, &vec![], VerificationFlags::P2SH), 0);

        let mut p2wsh = vec![OP_0, 0x20];
        p2wsh.extend_from_slice(&[0u8; 32]);
        let witness = vec![vec![OP_CHECKSIG, OP_CHECKSIG]];
        assert_eq!(count_witness_sigops(&[], &p2wsh, &witness, flags), 2);
    }
}
