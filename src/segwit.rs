//! Segregated witness: witness programs, weight and the witness commitment

use crate::constants::*;
use crate::hashes::{block_witness_merkle_root, sha256, sha256d};
use crate::opcodes::*;
use crate::script::{cast_to_bool, eval_script, next_op, ExecutionData, ScriptError, SigVersion, VerificationFlags};
use crate::serialization::block::{block_base_size, block_total_size};
use crate::serialization::transaction::{base_size, total_size};
use crate::signature::SignatureChecker;
use crate::taproot;
use crate::types::*;

/// Witness program: a version push (OP_0..OP_16) followed by one 2..40 byte push
pub fn witness_program(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = decode_small_int(script[0])?;
    if script[1] as usize + 2 != script.len() {
        return None;
    }
    Some((version, &script[2..]))
}

/// Weight: 𝒯𝒳 → ℕ = base size × 3 + total size
pub fn transaction_weight(tx: &Transaction) -> usize {
    base_size(tx) * (WITNESS_SCALE_FACTOR - 1) + total_size(tx)
}

pub fn block_weight(block: &Block) -> usize {
    block_base_size(block) * (WITNESS_SCALE_FACTOR - 1) + block_total_size(block)
}

/// Index of the coinbase output carrying the witness commitment (the last match)
pub fn witness_commitment_index(block: &Block) -> Option<usize> {
    let coinbase = block.coinbase()?;
    coinbase
        .outputs
        .iter()
        .rposition(|output| {
            output.script_pubkey.len() >= MINIMUM_WITNESS_COMMITMENT
                && output.script_pubkey[..6] == WITNESS_COMMITMENT_HEADER
        })
}

/// Coinbase commitment value: SHA256d(witness root || witness nonce)
pub fn witness_commitment(witness_root: &Hash, nonce: &[u8; 32]) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(witness_root);
    buf[32..].copy_from_slice(nonce);
    sha256d(&buf)
}

/// Check the witness commitment of a block in which segwit is active
///
/// Without a commitment no transaction may carry witness data. Failures are
/// returned as reject reasons; they all mean the block body was mutated.
pub fn check_witness_commitment(block: &Block) -> Result<(), &'static str> {
    if let Some(pos) = witness_commitment_index(block) {
        let coinbase = &block.transactions[0];
        let nonce_witness = &coinbase.inputs[0].witness;
        if nonce_witness.len() != 1 || nonce_witness[0].len() != 32 {
            return Err("bad-witness-nonce-size");
        }
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&nonce_witness[0]);
        let expected = witness_commitment(&block_witness_merkle_root(block), &nonce);
        if coinbase.outputs[pos].script_pubkey[6..38] != expected {
            return Err("bad-witness-merkle-match");
        }
        return Ok(());
    }
    if block.transactions.iter().any(|tx| tx.has_witness()) {
        return Err("unexpected-witness");
    }
    Ok(())
}

/// VerifyWitnessProgram
///
/// - v0, 32 bytes: P2WSH, the last witness item is the script, its SHA256 must match
/// - v0, 20 bytes: P2WPKH, exactly signature and key on the witness
/// - v0, other lengths fail
/// - v1, 32 bytes, not P2SH-wrapped: taproot when TAPROOT is active
/// - anything else is left for future soft forks and succeeds
pub fn verify_witness_program(
    witness: &Witness,
    version: u8,
    program: &[u8],
    flags: VerificationFlags,
    checker: &dyn SignatureChecker,
    is_p2sh: bool,
) -> Result<(), ScriptError> {
    let mut execdata = ExecutionData::default();
    match version {
        0 => {
            let mut stack = witness.clone();
            let script = match program.len() {
                32 => {
                    let script = stack.pop().ok_or(ScriptError::WitnessProgramWitnessEmpty)?;
                    if sha256(&script)[..] != *program {
                        return Err(ScriptError::WitnessProgramMismatch);
                    }
                    script
                }
                20 => {
                    if stack.len() != 2 {
                        return Err(ScriptError::WitnessProgramMismatch);
                    }
                    let mut script = vec![OP_DUP, OP_HASH160, 0x14];
                    script.extend_from_slice(program);
                    script.push(OP_EQUALVERIFY);
                    script.push(OP_CHECKSIG);
                    script
                }
                _ => return Err(ScriptError::WitnessProgramWrongLength),
            };
            execute_witness_script(stack, &script, flags, SigVersion::WitnessV0, checker, &mut execdata)
        }
        1 if program.len() == 32 && !is_p2sh => {
            if !flags.contains(VerificationFlags::TAPROOT) {
                return Ok(());
            }
            taproot::verify_taproot_spend(witness, program, flags, checker)
        }
        _ => Ok(()),
    }
}

/// Run a witness script on its initial stack; exactly one true element must remain
pub fn execute_witness_script(
    mut stack: Vec<ByteString>,
    script: &[u8],
    flags: VerificationFlags,
    sigversion: SigVersion,
    checker: &dyn SignatureChecker,
    execdata: &mut ExecutionData,
) -> Result<(), ScriptError> {
    if sigversion == SigVersion::Tapscript {
        let mut pc = 0;
        while pc < script.len() {
            let (opcode, _, next) = next_op(script, pc).ok_or(ScriptError::BadOpcode)?;
            if is_op_success(opcode) {
                return Ok(());
            }
            pc = next;
        }
        if stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if stack.iter().any(|item| item.len() > MAX_SCRIPT_ELEMENT_SIZE) {
        return Err(ScriptError::PushSize);
    }

    eval_script(&mut stack, script, flags, checker, sigversion, execdata)?;

    // witness scripts implicitly require clean stack behaviour
    if stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    if !cast_to_bool(&stack[0]) {
        return Err(ScriptError::EvalFalse);
    }
    Ok(())
}
