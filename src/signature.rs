//! Signature and public key encoding rules, and the transaction signature checker

use std::sync::OnceLock;

use secp256k1::{ecdsa, schnorr, Message, PublicKey, Secp256k1, VerifyOnly, XOnlyPublicKey};

use crate::constants::*;
use crate::script::{ExecutionData, ScriptError, SigVersion, VerificationFlags};
use crate::sighash::{self, PrecomputedTransactionData, SIGHASH_ANYONECANPAY, SIGHASH_DEFAULT};
use crate::types::*;

/// Shared verification-only context
pub fn secp() -> &'static Secp256k1<VerifyOnly> {
    static CONTEXT: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::verification_only)
}

/// Strict DER encoding including the trailing hash type byte (BIP66)
///
/// Layout: 0x30 [total-length] 0x02 [R-length] [R] 0x02 [S-length] [S] [sighash]
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != sig.len() - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != sig.len() {
        return false;
    }

    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }

    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

/// S must be at most half the curve order
pub fn is_low_der_signature(sig: &[u8]) -> bool {
    if !is_valid_signature_encoding(sig) {
        return false;
    }
    match ecdsa::Signature::from_der_lax(&sig[..sig.len() - 1]) {
        Ok(parsed) => {
            let mut normalized = parsed;
            normalized.normalize_s();
            normalized == parsed
        }
        Err(_) => false,
    }
}

pub fn is_defined_hashtype_signature(sig: &[u8]) -> bool {
    match sig.last() {
        Some(&last) => {
            let base = last & !SIGHASH_ANYONECANPAY;
            (sighash::SIGHASH_ALL..=sighash::SIGHASH_SINGLE).contains(&base)
        }
        None => false,
    }
}

pub fn is_compressed_or_uncompressed_pubkey(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x04) => pubkey.len() == 65,
        Some(0x02) | Some(0x03) => pubkey.len() == 33,
        _ => false,
    }
}

pub fn check_signature_encoding(sig: &[u8], flags: VerificationFlags) -> Result<(), ScriptError> {
    // Empty signatures are a compact way to provide an invalid signature for CHECK(MULTI)SIG
    if sig.is_empty() {
        return Ok(());
    }
    if flags.intersects(VerificationFlags::DERSIG | VerificationFlags::LOW_S | VerificationFlags::STRICTENC)
        && !is_valid_signature_encoding(sig)
    {
        return Err(ScriptError::SigDer);
    }
    if flags.contains(VerificationFlags::LOW_S) && !is_low_der_signature(sig) {
        return Err(ScriptError::SigHighS);
    }
    if flags.contains(VerificationFlags::STRICTENC) && !is_defined_hashtype_signature(sig) {
        return Err(ScriptError::SigHashtype);
    }
    Ok(())
}

pub fn check_pubkey_encoding(pubkey: &[u8], flags: VerificationFlags) -> Result<(), ScriptError> {
    if flags.contains(VerificationFlags::STRICTENC) && !is_compressed_or_uncompressed_pubkey(pubkey) {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

/// Length implied by the header byte of a serialized public key
fn pubkey_len_valid(pubkey: &[u8]) -> bool {
    let expected = match pubkey.first() {
        Some(0x02) | Some(0x03) => 33,
        Some(0x04) | Some(0x06) | Some(0x07) => 65,
        _ => return false,
    };
    pubkey.len() == expected
}

/// Lax DER ECDSA verification with S normalized, as consensus requires
pub fn verify_ecdsa(sig_der: &[u8], pubkey: &[u8], sighash: &Hash) -> bool {
    if !pubkey_len_valid(pubkey) {
        return false;
    }
    let pubkey = match PublicKey::from_slice(pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let mut signature = match ecdsa::Signature::from_der_lax(sig_der) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    signature.normalize_s();
    let message = match Message::from_digest_slice(sighash) {
        Ok(msg) => msg,
        Err(_) => return false,
    };
    secp().verify_ecdsa(&message, &signature, &pubkey).is_ok()
}

/// BIP340 verification of a 64-byte signature against an x-only key
pub fn verify_schnorr(sig: &[u8], pubkey: &[u8], sighash: &Hash) -> bool {
    let (signature, pubkey) = match (
        schnorr::Signature::from_slice(sig),
        XOnlyPublicKey::from_slice(pubkey),
    ) {
        (Ok(sig), Ok(pk)) => (sig, pk),
        _ => return false,
    };
    let message = match Message::from_digest_slice(sighash) {
        Ok(msg) => msg,
        Err(_) => return false,
    };
    secp().verify_schnorr(&signature, &message, &pubkey).is_ok()
}

/// Everything the interpreter needs to know about the spending transaction
pub trait SignatureChecker {
    fn check_ecdsa_signature(
        &self,
        sig: &[u8],
        pubkey: &[u8],
        script_code: &[u8],
        sigversion: SigVersion,
    ) -> bool;

    fn check_schnorr_signature(
        &self,
        sig: &[u8],
        pubkey: &[u8],
        sigversion: SigVersion,
        execdata: &ExecutionData,
    ) -> Result<(), ScriptError>;

    fn check_lock_time(&self, lock_time: i64) -> bool;

    fn check_sequence(&self, sequence: i64) -> bool;
}

/// Checker with no transaction: every signature and lock check fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSignatureChecker;

impl SignatureChecker for NullSignatureChecker {
    fn check_ecdsa_signature(&self, _: &[u8], _: &[u8], _: &[u8], _: SigVersion) -> bool {
        false
    }

    fn check_schnorr_signature(
        &self,
        _: &[u8],
        _: &[u8],
        _: SigVersion,
        _: &ExecutionData,
    ) -> Result<(), ScriptError> {
        Err(ScriptError::SchnorrSig)
    }

    fn check_lock_time(&self, _: i64) -> bool {
        false
    }

    fn check_sequence(&self, _: i64) -> bool {
        false
    }
}

/// Checks signatures against input `input_index` of `tx`
pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    amount: i64,
    txdata: &'a PrecomputedTransactionData,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(
        tx: &'a Transaction,
        input_index: usize,
        amount: i64,
        txdata: &'a PrecomputedTransactionData,
    ) -> Self {
        TransactionSignatureChecker {
            tx,
            input_index,
            amount,
            txdata,
        }
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_ecdsa_signature(
        &self,
        sig: &[u8],
        pubkey: &[u8],
        script_code: &[u8],
        sigversion: SigVersion,
    ) -> bool {
        if !pubkey_len_valid(pubkey) {
            return false;
        }
        let (hash_type, der) = match sig.split_last() {
            Some((hash_type, der)) => (*hash_type, der),
            None => return false,
        };
        let digest = match sigversion {
            SigVersion::Base => {
                sighash::legacy_signature_hash(script_code, self.tx, self.input_index, hash_type as u32)
            }
            SigVersion::WitnessV0 => sighash::segwit_v0_signature_hash(
                script_code,
                self.tx,
                self.input_index,
                hash_type as u32,
                self.amount,
                self.txdata,
            ),
            SigVersion::Taproot | SigVersion::Tapscript => return false,
        };
        verify_ecdsa(der, pubkey, &digest)
    }

    fn check_schnorr_signature(
        &self,
        sig: &[u8],
        pubkey: &[u8],
        sigversion: SigVersion,
        execdata: &ExecutionData,
    ) -> Result<(), ScriptError> {
        let (sig, hash_type) = match sig.len() {
            64 => (sig, SIGHASH_DEFAULT),
            65 => {
                // an explicit SIGHASH_DEFAULT byte is not allowed
                if sig[64] == SIGHASH_DEFAULT {
                    return Err(ScriptError::SchnorrSigHashtype);
                }
                (&sig[..64], sig[64])
            }
            _ => return Err(ScriptError::SchnorrSigSize),
        };
        let digest = sighash::taproot_signature_hash(
            self.tx,
            self.input_index,
            hash_type,
            sigversion,
            execdata,
            self.txdata,
        )?;
        if !verify_schnorr(sig, pubkey, &digest) {
            return Err(ScriptError::SchnorrSig);
        }
        Ok(())
    }

    /// BIP65: the operand and the transaction lock time must be of the same
    /// kind, the operand no larger, and the input not final.
    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx_lock_time = self.tx.lock_time as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;
        if !((tx_lock_time < threshold && lock_time < threshold)
            || (tx_lock_time >= threshold && lock_time >= threshold))
        {
            return false;
        }
        if lock_time > tx_lock_time {
            return false;
        }
        self.tx.inputs[self.input_index].sequence != SEQUENCE_FINAL
    }

    /// BIP112
    fn check_sequence(&self, sequence: i64) -> bool {
        let tx_sequence = self.tx.inputs[self.input_index].sequence as i64;
        if (self.tx.version as u32) < 2 {
            return false;
        }
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 != 0 {
            return false;
        }
        let mask = (SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK) as i64;
        let tx_masked = tx_sequence & mask;
        let op_masked = sequence & mask;
        let type_flag = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        if !((tx_masked < type_flag && op_masked < type_flag)
            || (tx_masked >= type_flag && op_masked >= type_flag))
        {
            return false;
        }
        op_masked <= tx_masked
    }
}
