//! Signature hash computation
//!
//! Three algorithms are in use depending on the script version being executed:
//! the original serialization-based digest, BIP143 for witness v0 and BIP341
//! for taproot. [`PrecomputedTransactionData`] caches the per-transaction
//! components so they are hashed once no matter how many inputs are checked.

use sha2::{Digest, Sha256};

use crate::error::{Result, ScriptVerifyError};
use crate::hashes::{finalize, sha256, sha256d, tagged_engine};
use crate::opcodes::OP_CODESEPARATOR;
use crate::script::{next_op, ExecutionData, ScriptError, SigVersion};
use crate::serialization::varint::write_varint;
use crate::serialization::{write_var_bytes, Encodable};
use crate::types::*;

pub const SIGHASH_DEFAULT: u8 = 0x00;
pub const SIGHASH_ALL: u8 = 0x01;
pub const SIGHASH_NONE: u8 = 0x02;
pub const SIGHASH_SINGLE: u8 = 0x03;
pub const SIGHASH_ANYONECANPAY: u8 = 0x80;
pub const SIGHASH_OUTPUT_MASK: u8 = 0x03;
pub const SIGHASH_INPUT_MASK: u8 = 0x80;

/// Digest returned by the legacy algorithm for out-of-range inputs
const ONE: Hash = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

/// BIP341 components that commit to every spent output
#[derive(Debug, Clone, PartialEq, Eq)]
struct SpentOutputHashes {
    amounts: Hash,
    scripts: Hash,
}

/// Per-transaction hash cache shared by all input checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecomputedTransactionData {
    prevouts_single: Hash,
    sequences_single: Hash,
    outputs_single: Hash,
    hash_prevouts: Hash,
    hash_sequence: Hash,
    hash_outputs: Hash,
    spent: Option<SpentOutputHashes>,
    spent_outputs: Vec<TransactionOutput>,
}

impl PrecomputedTransactionData {
    /// Build the cache. `spent_outputs` is either empty or holds the output
    /// spent by each input, in input order; taproot checks need the latter.
    pub fn new(tx: &Transaction, spent_outputs: Vec<TransactionOutput>) -> Result<Self> {
        if !spent_outputs.is_empty() && spent_outputs.len() != tx.inputs.len() {
            return Err(ScriptVerifyError::SpentOutputsMismatch {
                provided: spent_outputs.len(),
                inputs: tx.inputs.len(),
            }
            .into());
        }

        let mut prevouts = Vec::with_capacity(tx.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(tx.inputs.len() * 4);
        for input in &tx.inputs {
            input.prevout.encode(&mut prevouts);
            sequences.extend_from_slice(&input.sequence.to_le_bytes());
        }
        let mut outputs = Vec::new();
        for output in &tx.outputs {
            output.encode(&mut outputs);
        }

        let prevouts_single = sha256(&prevouts);
        let sequences_single = sha256(&sequences);
        let outputs_single = sha256(&outputs);

        let spent = if spent_outputs.is_empty() {
            None
        } else {
            let mut amounts = Vec::with_capacity(spent_outputs.len() * 8);
            let mut scripts = Vec::new();
            for output in &spent_outputs {
                amounts.extend_from_slice(&output.value.to_le_bytes());
                write_var_bytes(&mut scripts, &output.script_pubkey);
            }
            Some(SpentOutputHashes {
                amounts: sha256(&amounts),
                scripts: sha256(&scripts),
            })
        };

        Ok(PrecomputedTransactionData {
            prevouts_single,
            sequences_single,
            outputs_single,
            hash_prevouts: sha256(&prevouts_single),
            hash_sequence: sha256(&sequences_single),
            hash_outputs: sha256(&outputs_single),
            spent,
            spent_outputs,
        })
    }

    pub fn spent_outputs(&self) -> &[TransactionOutput] {
        &self.spent_outputs
    }

    /// Whether taproot signature hashes can be computed
    pub fn has_spent_outputs(&self) -> bool {
        self.spent.is_some()
    }
}

/// Script code as committed to by the legacy digest: OP_CODESEPARATORs removed
fn write_script_code_without_separators(out: &mut Vec<u8>, script: &[u8]) {
    let mut kept = Vec::with_capacity(script.len());
    let mut segment_start = 0;
    let mut pc = 0;
    while let Some((opcode, _, next)) = next_op(script, pc) {
        if opcode == OP_CODESEPARATOR {
            kept.extend_from_slice(&script[segment_start..pc]);
            segment_start = next;
        }
        pc = next;
    }
    if segment_start < script.len() {
        kept.extend_from_slice(&script[segment_start..]);
    }
    write_var_bytes(out, &kept);
}

/// SignatureHash for scripts executed without witness
///
/// Returns the constant 1 when the input index is out of range, or for
/// SIGHASH_SINGLE without a matching output; signatures over that value are
/// valid consensus-wise.
pub fn legacy_signature_hash(script_code: &[u8], tx: &Transaction, input_index: usize, hash_type: u32) -> Hash {
    if input_index >= tx.inputs.len() {
        return ONE;
    }
    let base = (hash_type as u8) & 0x1f;
    let anyone_can_pay = hash_type as u8 & SIGHASH_ANYONECANPAY != 0;
    let hash_single = base == SIGHASH_SINGLE;
    let hash_none = base == SIGHASH_NONE;
    if hash_single && input_index >= tx.outputs.len() {
        return ONE;
    }

    let mut ser = Vec::new();
    ser.extend_from_slice(&tx.version.to_le_bytes());

    let input_count = if anyone_can_pay { 1 } else { tx.inputs.len() };
    write_varint(&mut ser, input_count as u64);
    for i in 0..input_count {
        let idx = if anyone_can_pay { input_index } else { i };
        let input = &tx.inputs[idx];
        input.prevout.encode(&mut ser);
        if idx == input_index {
            write_script_code_without_separators(&mut ser, script_code);
        } else {
            write_varint(&mut ser, 0);
        }
        let sequence = if idx != input_index && (hash_single || hash_none) {
            0
        } else {
            input.sequence
        };
        ser.extend_from_slice(&sequence.to_le_bytes());
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.outputs.len()
    };
    write_varint(&mut ser, output_count as u64);
    for i in 0..output_count {
        if hash_single && i != input_index {
            // blanked output: value -1, empty script
            ser.extend_from_slice(&(-1i64).to_le_bytes());
            write_varint(&mut ser, 0);
        } else {
            tx.outputs[i].encode(&mut ser);
        }
    }

    ser.extend_from_slice(&tx.lock_time.to_le_bytes());
    ser.extend_from_slice(&hash_type.to_le_bytes());
    sha256d(&ser)
}

/// BIP143 digest for witness v0 scripts
pub fn segwit_v0_signature_hash(
    script_code: &[u8],
    tx: &Transaction,
    input_index: usize,
    hash_type: u32,
    amount: i64,
    txdata: &PrecomputedTransactionData,
) -> Hash {
    let base = hash_type as u8 & 0x1f;
    let anyone_can_pay = hash_type as u8 & SIGHASH_ANYONECANPAY != 0;
    let zero = [0u8; 32];

    let hash_prevouts = if anyone_can_pay { zero } else { txdata.hash_prevouts };
    let hash_sequence = if !anyone_can_pay && base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        txdata.hash_sequence
    } else {
        zero
    };
    let hash_outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        txdata.hash_outputs
    } else if base == SIGHASH_SINGLE && input_index < tx.outputs.len() {
        sha256d(&tx.outputs[input_index].to_bytes())
    } else {
        zero
    };

    let input = &tx.inputs[input_index];
    let mut ser = Vec::with_capacity(160 + script_code.len());
    ser.extend_from_slice(&tx.version.to_le_bytes());
    ser.extend_from_slice(&hash_prevouts);
    ser.extend_from_slice(&hash_sequence);
    input.prevout.encode(&mut ser);
    write_var_bytes(&mut ser, script_code);
    ser.extend_from_slice(&amount.to_le_bytes());
    ser.extend_from_slice(&input.sequence.to_le_bytes());
    ser.extend_from_slice(&hash_outputs);
    ser.extend_from_slice(&tx.lock_time.to_le_bytes());
    ser.extend_from_slice(&hash_type.to_le_bytes());
    sha256d(&ser)
}

/// BIP341 SigMsg hashed with the TapSighash tag
///
/// 1. Reject undefined hash types and SIGHASH_SINGLE without a matching output
/// 2. Commit to epoch, hash type, version, lock time
/// 3. Commit to all prevouts, amounts, scripts and sequences unless ANYONECANPAY
/// 4. Commit to all outputs for SIGHASH_ALL/DEFAULT
/// 5. Commit to spend type and this input (annex if present)
/// 6. Commit to this output for SIGHASH_SINGLE
/// 7. For script path spends, commit to leaf hash, key version and code separator position
pub fn taproot_signature_hash(
    tx: &Transaction,
    input_index: usize,
    hash_type: u8,
    sigversion: SigVersion,
    execdata: &ExecutionData,
    txdata: &PrecomputedTransactionData,
) -> std::result::Result<Hash, ScriptError> {
    let spent = txdata.spent.as_ref().ok_or(ScriptError::MissingSpentOutputs)?;
    let ext_flag: u8 = match sigversion {
        SigVersion::Taproot => 0,
        SigVersion::Tapscript => 1,
        _ => return Err(ScriptError::SchnorrSigHashtype),
    };

    let output_type = if hash_type == SIGHASH_DEFAULT {
        SIGHASH_ALL
    } else {
        hash_type & SIGHASH_OUTPUT_MASK
    };
    let input_type = hash_type & SIGHASH_INPUT_MASK;
    if !(hash_type <= 0x03 || (0x81..=0x83).contains(&hash_type)) {
        return Err(ScriptError::SchnorrSigHashtype);
    }
    if output_type == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        return Err(ScriptError::SchnorrSigHashtype);
    }

    let mut engine: Sha256 = tagged_engine("TapSighash");
    engine.update([0u8]); // epoch
    engine.update([hash_type]);
    engine.update(tx.version.to_le_bytes());
    engine.update(tx.lock_time.to_le_bytes());
    if input_type != SIGHASH_ANYONECANPAY {
        engine.update(txdata.prevouts_single);
        engine.update(spent.amounts);
        engine.update(spent.scripts);
        engine.update(txdata.sequences_single);
    }
    if output_type == SIGHASH_ALL {
        engine.update(txdata.outputs_single);
    }

    let annex_present = execdata.annex_hash.is_some();
    let spend_type = (ext_flag << 1) + annex_present as u8;
    engine.update([spend_type]);
    if input_type == SIGHASH_ANYONECANPAY {
        let input = &tx.inputs[input_index];
        engine.update(input.prevout.to_bytes());
        engine.update(txdata.spent_outputs[input_index].to_bytes());
        engine.update(input.sequence.to_le_bytes());
    } else {
        engine.update((input_index as u32).to_le_bytes());
    }
    if let Some(annex_hash) = execdata.annex_hash {
        engine.update(annex_hash);
    }

    if output_type == SIGHASH_SINGLE {
        engine.update(sha256(&tx.outputs[input_index].to_bytes()));
    }

    if sigversion == SigVersion::Tapscript {
        let leaf_hash = execdata.tapleaf_hash.ok_or(ScriptError::SchnorrSigHashtype)?;
        engine.update(leaf_hash);
        engine.update([0u8]); // key_version
        engine.update(execdata.codeseparator_pos.to_le_bytes());
    }

    Ok(finalize(engine))
}
