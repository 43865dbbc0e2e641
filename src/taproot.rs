//! Taproot (BIP341) commitments and spending rules

use secp256k1::{Parity, Scalar, XOnlyPublicKey};

use crate::constants::*;
use crate::hashes::{sha256, tagged_hash};
use crate::opcodes::OP_1;
use crate::script::{ExecutionData, ScriptError, SigVersion, VerificationFlags};
use crate::segwit::execute_witness_script;
use crate::serialization::transaction::encode_witness;
use crate::serialization::write_var_bytes;
use crate::signature::{secp, SignatureChecker};
use crate::types::*;

pub const TAPROOT_LEAF_MASK: u8 = 0xfe;
pub const TAPROOT_LEAF_TAPSCRIPT: u8 = 0xc0;
pub const TAPROOT_CONTROL_BASE_SIZE: usize = 33;
pub const TAPROOT_CONTROL_NODE_SIZE: usize = 32;
pub const TAPROOT_CONTROL_MAX_NODE_COUNT: usize = 128;
pub const TAPROOT_CONTROL_MAX_SIZE: usize =
    TAPROOT_CONTROL_BASE_SIZE + TAPROOT_CONTROL_NODE_SIZE * TAPROOT_CONTROL_MAX_NODE_COUNT;
pub const ANNEX_TAG: u8 = 0x50;

/// OP_1 <32 bytes>
pub fn is_taproot_output(script: &[u8]) -> bool {
    script.len() == 34 && script[0] == OP_1 && script[1] == 0x20
}

/// TapLeaf hash: hash_TapLeaf(leaf_version || compact_size(script) || script)
pub fn tapleaf_hash(leaf_version: u8, script: &[u8]) -> Hash {
    let mut buf = Vec::with_capacity(script.len() + 4);
    buf.push(leaf_version);
    write_var_bytes(&mut buf, script);
    tagged_hash("TapLeaf", &buf)
}

/// TapBranch hash of two children, ordered lexicographically
pub fn tapbranch_hash(a: &Hash, b: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    buf[..32].copy_from_slice(first);
    buf[32..].copy_from_slice(second);
    tagged_hash("TapBranch", &buf)
}

/// Tweak committing an internal key to an optional script tree root
pub fn taptweak_hash(internal_key: &[u8; 32], merkle_root: Option<&Hash>) -> Hash {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(internal_key);
    if let Some(root) = merkle_root {
        buf.extend_from_slice(root);
    }
    tagged_hash("TapTweak", &buf)
}

/// Output key Q = P + t·G, returned with the parity of Q
pub fn tweak_internal_key(internal_key: &[u8; 32], merkle_root: Option<&Hash>) -> Option<([u8; 32], Parity)> {
    let internal = XOnlyPublicKey::from_slice(internal_key).ok()?;
    let tweak = Scalar::from_be_bytes(taptweak_hash(internal_key, merkle_root)).ok()?;
    let (output, parity) = internal.add_tweak(secp(), &tweak).ok()?;
    Some((output.serialize(), parity))
}

/// Walk the control block path from a leaf hash up to the tree root
pub fn compute_merkle_root(control: &[u8], leaf_hash: Hash) -> Hash {
    control[TAPROOT_CONTROL_BASE_SIZE..]
        .chunks_exact(TAPROOT_CONTROL_NODE_SIZE)
        .fold(leaf_hash, |k, node| {
            let mut sibling = [0u8; 32];
            sibling.copy_from_slice(node);
            tapbranch_hash(&k, &sibling)
        })
}

/// Whether `program` is the output key committing to the leaf through `control`
pub fn verify_taproot_commitment(control: &[u8], program: &[u8], leaf_hash: Hash) -> bool {
    let internal_bytes: [u8; 32] = match control[1..TAPROOT_CONTROL_BASE_SIZE].try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let (internal, output) = match (
        XOnlyPublicKey::from_slice(&internal_bytes),
        XOnlyPublicKey::from_slice(program),
    ) {
        (Ok(p), Ok(q)) => (p, q),
        _ => return false,
    };
    let root = compute_merkle_root(control, leaf_hash);
    let tweak = match Scalar::from_be_bytes(taptweak_hash(&internal_bytes, Some(&root))) {
        Ok(tweak) => tweak,
        Err(_) => return false,
    };
    let parity = if control[0] & 1 == 0 { Parity::Even } else { Parity::Odd };
    internal.tweak_add_check(secp(), &output, parity, tweak)
}

/// Spend a v1 witness program
///
/// 1. An empty witness fails
/// 2. With two or more items, a last item starting with 0x50 is the annex
/// 3. One item left: key path, a Schnorr signature against the output key
/// 4. Otherwise script path: the last item is the control block, the one
///    before the script; the script must be committed to by the output key
/// 5. Leaf version 0xc0 runs as tapscript, unknown versions succeed
pub fn verify_taproot_spend(
    witness: &Witness,
    program: &[u8],
    flags: VerificationFlags,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    let mut stack = witness.clone();
    if stack.is_empty() {
        return Err(ScriptError::WitnessProgramWitnessEmpty);
    }
    let mut execdata = ExecutionData::default();
    if stack.len() >= 2 && stack.last().and_then(|item| item.first()) == Some(&ANNEX_TAG) {
        if let Some(annex) = stack.pop() {
            let mut serialized = Vec::with_capacity(annex.len() + 3);
            write_var_bytes(&mut serialized, &annex);
            execdata.annex_hash = Some(sha256(&serialized));
        }
    }

    if stack.len() == 1 {
        return checker.check_schnorr_signature(&stack[0], program, SigVersion::Taproot, &execdata);
    }

    let control = stack.pop().ok_or(ScriptError::WitnessProgramWitnessEmpty)?;
    let script = stack.pop().ok_or(ScriptError::WitnessProgramWitnessEmpty)?;
    if control.len() < TAPROOT_CONTROL_BASE_SIZE
        || control.len() > TAPROOT_CONTROL_MAX_SIZE
        || (control.len() - TAPROOT_CONTROL_BASE_SIZE) % TAPROOT_CONTROL_NODE_SIZE != 0
    {
        return Err(ScriptError::TaprootWrongControlSize);
    }
    let leaf_version = control[0] & TAPROOT_LEAF_MASK;
    let leaf_hash = tapleaf_hash(leaf_version, &script);
    if !verify_taproot_commitment(&control, program, leaf_hash) {
        return Err(ScriptError::WitnessProgramMismatch);
    }
    execdata.tapleaf_hash = Some(leaf_hash);

    if leaf_version != TAPROOT_LEAF_TAPSCRIPT {
        return Ok(());
    }
    let mut witness_bytes = Vec::new();
    encode_witness(witness, &mut witness_bytes);
    execdata.validation_weight_left = Some(witness_bytes.len() as i64 + VALIDATION_WEIGHT_OFFSET);
    execute_witness_script(stack, &script, flags, SigVersion::Tapscript, checker, &mut execdata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::*;
    use crate::signature::NullSignatureChecker;
    use secp256k1::{Keypair, Secp256k1, SecretKey};

    fn internal_key() -> [u8; 32] {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let keypair = Keypair::from_secret_key(&secp, &secret);
        keypair.x_only_public_key().0.serialize()
    }

    fn control_block(internal: &[u8; 32], parity: Parity, leaf_version: u8, path: &[Hash]) -> Vec<u8> {
        let mut control = vec![leaf_version | if parity == Parity::Odd { 1 } else { 0 }];
        control.extend_from_slice(internal);
        for node in path {
            control.extend_from_slice(node);
        }
        control
    }

    #[test]
    fn test_tapbranch_is_symmetric() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_eq!(tapbranch_hash(&a, &b), tapbranch_hash(&b, &a));
    }

    #[test]
    fn test_script_path_single_leaf() {
        let internal = internal_key();
        let script = vec![OP_1];
        let leaf = tapleaf_hash(TAPROOT_LEAF_TAPSCRIPT, &script);
        let (output, parity) = tweak_internal_key(&internal, Some(&leaf)).unwrap();
        let control = control_block(&internal, parity, TAPROOT_LEAF_TAPSCRIPT, &[]);
        let witness = vec![script, control];
        assert!(verify_taproot_spend(&witness, &output, VerificationFlags::ALL, &NullSignatureChecker).is_ok());
    }

    #[test]
    fn test_script_path_with_sibling_and_annex() {
        let internal = internal_key();
        let script = vec![OP_2, OP_2, OP_EQUAL];
        let sibling = tapleaf_hash(TAPROOT_LEAF_TAPSCRIPT, &[OP_RETURN]);
        let leaf = tapleaf_hash(TAPROOT_LEAF_TAPSCRIPT, &script);
        let root = tapbranch_hash(&leaf, &sibling);
        let (output, parity) = tweak_internal_key(&internal, Some(&root)).unwrap();
        let control = control_block(&internal, parity, TAPROOT_LEAF_TAPSCRIPT, &[sibling]);
        let witness = vec![script, control, vec![ANNEX_TAG, 0x01]];
        assert!(verify_taproot_spend(&witness, &output, VerificationFlags::ALL, &NullSignatureChecker).is_ok());
    }

    #[test]
    fn test_wrong_commitment() {
        let internal = internal_key();
        let script = vec![OP_1];
        let leaf = tapleaf_hash(TAPROOT_LEAF_TAPSCRIPT, &script);
        let (output, parity) = tweak_internal_key(&internal, Some(&leaf)).unwrap();
        let control = control_block(&internal, parity, TAPROOT_LEAF_TAPSCRIPT, &[]);
        let witness = vec![vec![OP_2], control];
        assert_eq!(
            verify_taproot_spend(&witness, &output, VerificationFlags::ALL, &NullSignatureChecker),
            Err(ScriptError::WitnessProgramMismatch)
        );
    }

    #[test]
    fn test_control_block_size() {
        let witness = vec![vec![OP_1], vec![TAPROOT_LEAF_TAPSCRIPT; 34]];
        assert_eq!(
            verify_taproot_spend(&witness, &[0u8; 32], VerificationFlags::ALL, &NullSignatureChecker),
            Err(ScriptError::TaprootWrongControlSize)
        );
    }

    #[test]
    fn test_unknown_leaf_version_succeeds() {
        let internal = internal_key();
        let script = vec![OP_RETURN];
        let leaf = tapleaf_hash(0xc2, &script);
        let (output, parity) = tweak_internal_key(&internal, Some(&leaf)).unwrap();
        let control = control_block(&internal, parity, 0xc2, &[]);
        let witness = vec![script, control];
        assert!(verify_taproot_spend(&witness, &output, VerificationFlags::ALL, &NullSignatureChecker).is_ok());
    }

    #[test]
    fn test_op_success_short_circuits() {
        let internal = internal_key();
        // OP_CAT is OP_SUCCESS in tapscript
        let script = vec![OP_CAT, OP_RETURN];
        let leaf = tapleaf_hash(TAPROOT_LEAF_TAPSCRIPT, &script);
        let (output, parity) = tweak_internal_key(&internal, Some(&leaf)).unwrap();
        let control = control_block(&internal, parity, TAPROOT_LEAF_TAPSCRIPT, &[]);
        let witness = vec![script, control];
        assert!(verify_taproot_spend(&witness, &output, VerificationFlags::ALL, &NullSignatureChecker).is_ok());
    }

    #[test]
    fn test_tapscript_rejects_checkmultisig() {
        let internal = internal_key();
        let script = vec![OP_0, OP_0, OP_0, OP_CHECKMULTISIG];
        let leaf = tapleaf_hash(TAPROOT_LEAF_TAPSCRIPT, &script);
        let (output, parity) = tweak_internal_key(&internal, Some(&leaf)).unwrap();
        let control = control_block(&internal, parity, TAPROOT_LEAF_TAPSCRIPT, &[]);
        let witness = vec![script, control];
        assert_eq!(
            verify_taproot_spend(&witness, &output, VerificationFlags::ALL, &NullSignatureChecker),
            Err(ScriptError::TapscriptCheckMultiSig)
        );
    }

    #[test]
    fn test_empty_witness() {
        assert_eq!(
            verify_taproot_spend(&vec![], &[0u8; 32], VerificationFlags::ALL, &NullSignatureChecker),
            Err(ScriptError::WitnessProgramWitnessEmpty)
        );
    }
}
