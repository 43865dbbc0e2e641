//! Script execution engine
//!
//! A stack machine over byte vectors. The same interpreter runs legacy
//! scripts, P2SH redeem scripts, witness v0 scripts and tapscripts; the
//! [`SigVersion`] selects which historical rule set applies.

use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;

use crate::constants::*;
use crate::error::ScriptVerifyError;
use crate::hashes;
use crate::opcodes::*;
use crate::segwit;
use crate::sighash::PrecomputedTransactionData;
use crate::signature::{self, SignatureChecker, TransactionSignatureChecker};
use crate::types::*;

/// Which rule set a script runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigVersion {
    /// Bare scripts and P2SH redeem scripts
    Base,
    /// BIP143 witness v0 scripts
    WitnessV0,
    /// BIP341 key path spending
    Taproot,
    /// BIP342 script path spending
    Tapscript,
}

/// State carried across the execution of one input's scripts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionData {
    /// Leaf hash of the executing tapscript
    pub tapleaf_hash: Option<Hash>,
    /// Opcode position of the last executed OP_CODESEPARATOR
    pub codeseparator_pos: u32,
    /// SHA256 of the serialized annex, when present
    pub annex_hash: Option<Hash>,
    /// Remaining tapscript signature budget
    pub validation_weight_left: Option<i64>,
}

impl Default for ExecutionData {
    fn default() -> Self {
        ExecutionData {
            tapleaf_hash: None,
            codeseparator_pos: u32::MAX,
            annex_hash: None,
            validation_weight_left: None,
        }
    }
}

/// Script verification flags
///
/// Each flag switches on one soft-fork or policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VerificationFlags(u32);

impl VerificationFlags {
    pub const NONE: Self = Self(0);
    pub const P2SH: Self = Self(1 << 0);
    pub const STRICTENC: Self = Self(1 << 1);
    pub const DERSIG: Self = Self(1 << 2);
    pub const LOW_S: Self = Self(1 << 3);
    pub const NULLDUMMY: Self = Self(1 << 4);
    pub const SIGPUSHONLY: Self = Self(1 << 5);
    pub const MINIMALDATA: Self = Self(1 << 6);
    pub const DISCOURAGE_UPGRADABLE_NOPS: Self = Self(1 << 7);
    pub const CLEANSTACK: Self = Self(1 << 8);
    pub const CHECKLOCKTIMEVERIFY: Self = Self(1 << 9);
    pub const CHECKSEQUENCEVERIFY: Self = Self(1 << 10);
    pub const WITNESS: Self = Self(1 << 11);
    pub const MINIMALIF: Self = Self(1 << 13);
    pub const NULLFAIL: Self = Self(1 << 14);
    pub const TAPROOT: Self = Self(1 << 17);

    /// The consensus flags of a fully upgraded node
    pub const ALL: Self = Self(
        Self::P2SH.0
            | Self::DERSIG.0
            | Self::NULLDUMMY.0
            | Self::CHECKLOCKTIMEVERIFY.0
            | Self::CHECKSEQUENCEVERIFY.0
            | Self::WITNESS.0
            | Self::TAPROOT.0,
    );

    const KNOWN: u32 = Self::ALL.0
        | Self::STRICTENC.0
        | Self::LOW_S.0
        | Self::SIGPUSHONLY.0
        | Self::MINIMALDATA.0
        | Self::DISCOURAGE_UPGRADABLE_NOPS.0
        | Self::CLEANSTACK.0
        | Self::MINIMALIF.0
        | Self::NULLFAIL.0;

    /// Interpret raw bits, rejecting any bit without a meaning
    pub fn from_bits(bits: u32) -> Result<Self, ScriptVerifyError> {
        if bits & !Self::KNOWN != 0 {
            return Err(ScriptVerifyError::UnknownFlags(bits & !Self::KNOWN));
        }
        Ok(Self(bits))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// CLEANSTACK needs P2SH and WITNESS, WITNESS needs P2SH
    pub fn check_combination(self) -> Result<(), ScriptVerifyError> {
        if self.contains(Self::CLEANSTACK) && !self.contains(Self::P2SH | Self::WITNESS) {
            return Err(ScriptVerifyError::InvalidFlagsCombination);
        }
        if self.contains(Self::WITNESS) && !self.contains(Self::P2SH) {
            return Err(ScriptVerifyError::InvalidFlagsCombination);
        }
        Ok(())
    }
}

impl BitOr for VerificationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for VerificationFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Why a script failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Script evaluated without error but finished with a false/empty top stack element")]
    EvalFalse,
    #[error("OP_RETURN was encountered")]
    OpReturn,
    #[error("Script is too big")]
    ScriptSize,
    #[error("Push value size limit exceeded")]
    PushSize,
    #[error("Operation limit exceeded")]
    OpCount,
    #[error("Stack size limit exceeded")]
    StackSize,
    #[error("Signature count negative or greater than pubkey count")]
    SigCount,
    #[error("Pubkey count negative or limit exceeded")]
    PubkeyCount,
    #[error("Script failed an OP_VERIFY operation")]
    Verify,
    #[error("Script failed an OP_EQUALVERIFY operation")]
    EqualVerify,
    #[error("Script failed an OP_CHECKMULTISIGVERIFY operation")]
    CheckMultiSigVerify,
    #[error("Script failed an OP_CHECKSIGVERIFY operation")]
    CheckSigVerify,
    #[error("Script failed an OP_NUMEQUALVERIFY operation")]
    NumEqualVerify,
    #[error("Opcode missing or not understood")]
    BadOpcode,
    #[error("Attempted to use a disabled opcode")]
    DisabledOpcode,
    #[error("Operation not valid with the current stack size")]
    InvalidStackOperation,
    #[error("Operation not valid with the current altstack size")]
    InvalidAltstackOperation,
    #[error("Invalid OP_IF construction")]
    UnbalancedConditional,
    #[error("Negative locktime")]
    NegativeLocktime,
    #[error("Locktime requirement not satisfied")]
    UnsatisfiedLocktime,
    #[error("Signature hash type missing or not understood")]
    SigHashtype,
    #[error("Non-canonical DER signature")]
    SigDer,
    #[error("Data push larger than necessary")]
    MinimalData,
    #[error("Only push operators allowed in signatures")]
    SigPushOnly,
    #[error("Non-canonical signature: S value is unnecessarily high")]
    SigHighS,
    #[error("Dummy CHECKMULTISIG argument must be zero")]
    SigNullDummy,
    #[error("Public key is neither compressed or uncompressed")]
    PubkeyType,
    #[error("Stack size must be exactly one after execution")]
    CleanStack,
    #[error("OP_IF/NOTIF argument must be minimal")]
    MinimalIf,
    #[error("Signature must be zero for failed CHECK(MULTI)SIG operation")]
    SigNullFail,
    #[error("NOPx reserved for soft-fork upgrades")]
    DiscourageUpgradableNops,
    #[error("Witness program has incorrect length")]
    WitnessProgramWrongLength,
    #[error("Witness program was passed an empty witness")]
    WitnessProgramWitnessEmpty,
    #[error("Witness program hash mismatch")]
    WitnessProgramMismatch,
    #[error("Witness requires empty scriptSig")]
    WitnessMalleated,
    #[error("Witness requires only-redeemscript scriptSig")]
    WitnessMalleatedP2SH,
    #[error("Witness provided for non-witness script")]
    WitnessUnexpected,
    #[error("Invalid Schnorr signature size")]
    SchnorrSigSize,
    #[error("Invalid Schnorr signature hash type")]
    SchnorrSigHashtype,
    #[error("Invalid Schnorr signature")]
    SchnorrSig,
    #[error("Invalid Taproot control block size")]
    TaprootWrongControlSize,
    #[error("Too much signature validation relative to witness weight")]
    TapscriptValidationWeight,
    #[error("OP_CHECKMULTISIG(VERIFY) is not available in tapscript")]
    TapscriptCheckMultiSig,
    #[error("OP_IF/NOTIF argument must be minimal in tapscript")]
    TapscriptMinimalIf,
    #[error("Script number overflow")]
    ScriptNumOverflow,
    #[error("Non-minimally encoded script number")]
    ScriptNumNotMinimal,
    #[error("Taproot signature hash requires the spent outputs")]
    MissingSpentOutputs,
}

// ============================================================================
// SCRIPT NUMBERS
// ============================================================================

/// Script integer: little-endian sign-magnitude, bounded byte width
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScriptNum(i64);

impl ScriptNum {
    pub fn new(value: i64) -> Self {
        ScriptNum(value)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    /// Decode a stack element
    ///
    /// Fails when longer than `max_size`, or, with `require_minimal`, when the
    /// encoding carries a redundant trailing byte.
    pub fn from_bytes(bytes: &[u8], require_minimal: bool, max_size: usize) -> Result<Self, ScriptError> {
        if bytes.len() > max_size {
            return Err(ScriptError::ScriptNumOverflow);
        }
        if require_minimal {
            if let Some(&last) = bytes.last() {
                // the last byte may only be 0x00/0x80 when the previous byte needs its high bit
                if last & 0x7f == 0 && (bytes.len() <= 1 || bytes[bytes.len() - 2] & 0x80 == 0) {
                    return Err(ScriptError::ScriptNumNotMinimal);
                }
            }
        }
        if bytes.is_empty() {
            return Ok(ScriptNum(0));
        }
        let mut result: i64 = 0;
        for (i, byte) in bytes.iter().enumerate() {
            result |= (*byte as i64) << (8 * i);
        }
        let last = bytes[bytes.len() - 1];
        if last & 0x80 != 0 {
            let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
            return Ok(ScriptNum(-(result & mask)));
        }
        Ok(ScriptNum(result))
    }

    pub fn to_bytes(self) -> Vec<u8> {
        if self.0 == 0 {
            return Vec::new();
        }
        let negative = self.0 < 0;
        let mut abs = self.0.unsigned_abs();
        let mut out = Vec::with_capacity(9);
        while abs > 0 {
            out.push((abs & 0xff) as u8);
            abs >>= 8;
        }
        let last = out.len() - 1;
        if out[last] & 0x80 != 0 {
            out.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            out[last] |= 0x80;
        }
        out
    }

    /// Value clamped into i32, as used for counts and indices
    pub fn to_i32(self) -> i32 {
        self.0.clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }
}

/// Truthiness of a stack element: any non-zero byte, except negative zero
pub fn cast_to_bool(bytes: &[u8]) -> bool {
    for (i, byte) in bytes.iter().enumerate() {
        if *byte != 0 {
            return !(i == bytes.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn bool_bytes(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Decode the operation at `pc`: opcode, pushed data and the next position.
/// Returns `None` at the end of the script or on a truncated push.
pub fn next_op(script: &[u8], pc: usize) -> Option<(u8, &[u8], usize)> {
    let opcode = *script.get(pc)?;
    let mut pos = pc + 1;
    if opcode > OP_PUSHDATA4 {
        return Some((opcode, &[], pos));
    }
    let len = match opcode {
        OP_PUSHDATA1 => {
            let len = *script.get(pos)? as usize;
            pos += 1;
            len
        }
        OP_PUSHDATA2 => {
            let bytes = script.get(pos..pos + 2)?;
            pos += 2;
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize
        }
        OP_PUSHDATA4 => {
            let bytes = script.get(pos..pos + 4)?;
            pos += 4;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        }
        n => n as usize,
    };
    let data = script.get(pos..pos.checked_add(len)?)?;
    Some((opcode, data, pos + len))
}

/// Iterator over the operations of a script; yields `Err` once on a malformed push
pub struct Instructions<'a> {
    script: &'a [u8],
    pc: usize,
    failed: bool,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(u8, &'a [u8]), ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pc >= self.script.len() {
            return None;
        }
        match next_op(self.script, self.pc) {
            Some((opcode, data, next)) => {
                self.pc = next;
                Some(Ok((opcode, data)))
            }
            None => {
                self.failed = true;
                Some(Err(ScriptError::BadOpcode))
            }
        }
    }
}

pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions {
        script,
        pc: 0,
        failed: false,
    }
}

/// Append the canonical push of `data`
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// Whether `data` was pushed with the smallest possible opcode
pub fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    match data.len() {
        0 => opcode == OP_0,
        1 if (1..=16).contains(&data[0]) => opcode == OP_1 + data[0] - 1,
        1 if data[0] == 0x81 => opcode == OP_1NEGATE,
        n if n <= 75 => opcode as usize == n,
        n if n <= 255 => opcode == OP_PUSHDATA1,
        n if n <= 65535 => opcode == OP_PUSHDATA2,
        _ => true,
    }
}

/// Only push operations (OP_RESERVED counts as a push here)
pub fn is_push_only(script: &[u8]) -> bool {
    instructions(script).all(|op| matches!(op, Ok((opcode, _)) if opcode <= OP_16))
}

/// OP_HASH160 <20 bytes> OP_EQUAL
pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// Provably unspendable output: starts with OP_RETURN or is oversized
pub fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN) || script.len() > MAX_SCRIPT_SIZE
}

/// Remove every occurrence of `needle` that starts on an opcode boundary
pub fn find_and_delete(script: &mut Vec<u8>, needle: &[u8]) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut found = 0;
    let mut result = Vec::with_capacity(script.len());
    let mut pc = 0;
    let mut copied_to = 0;
    loop {
        result.extend_from_slice(&script[copied_to..pc]);
        while script.len() - pc >= needle.len() && &script[pc..pc + needle.len()] == needle {
            pc += needle.len();
            found += 1;
        }
        copied_to = pc;
        match next_op(script, pc) {
            Some((_, _, next)) => pc = next,
            None => break,
        }
    }
    if found > 0 {
        result.extend_from_slice(&script[copied_to..]);
        *script = result;
    }
    found
}

/// Small builder for assembling scripts
#[derive(Debug, Default, Clone)]
pub struct ScriptBuilder(Vec<u8>);

impl ScriptBuilder {
    pub fn new() -> Self {
        ScriptBuilder(Vec::new())
    }

    pub fn push_opcode(mut self, opcode: u8) -> Self {
        self.0.push(opcode);
        self
    }

    pub fn push_slice(mut self, data: &[u8]) -> Self {
        push_data(&mut self.0, data);
        self
    }

    /// Push an integer using OP_0..OP_16/OP_1NEGATE where possible
    pub fn push_int(mut self, value: i64) -> Self {
        if value == -1 || (1..=16).contains(&value) {
            self.0.push((OP_1 as i64 + value - 1) as u8);
        } else if value == 0 {
            self.0.push(OP_0);
        } else {
            push_data(&mut self.0, &ScriptNum::new(value).to_bytes());
        }
        self
    }

    pub fn into_bytes(self) -> ByteString {
        self.0
    }
}

// ============================================================================
// INTERPRETER
// ============================================================================

/// Tracks nested IF/ELSE state without storing every entry
struct ConditionStack {
    size: usize,
    first_false_pos: Option<usize>,
}

impl ConditionStack {
    fn new() -> Self {
        ConditionStack {
            size: 0,
            first_false_pos: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn all_true(&self) -> bool {
        self.first_false_pos.is_none()
    }

    fn push(&mut self, value: bool) {
        if self.first_false_pos.is_none() && !value {
            self.first_false_pos = Some(self.size);
        }
        self.size += 1;
    }

    fn pop(&mut self) {
        self.size -= 1;
        if self.first_false_pos == Some(self.size) {
            self.first_false_pos = None;
        }
    }

    fn toggle_top(&mut self) {
        match self.first_false_pos {
            None => self.first_false_pos = Some(self.size - 1),
            Some(pos) if pos == self.size - 1 => self.first_false_pos = None,
            Some(_) => {}
        }
    }
}

/// Element `depth` positions from the top (1 = top)
fn stack_top(stack: &[ByteString], depth: usize) -> Result<&ByteString, ScriptError> {
    if depth == 0 || stack.len() < depth {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - depth])
}

fn pop(stack: &mut Vec<ByteString>) -> Result<ByteString, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn require(stack: &[ByteString], n: usize) -> Result<(), ScriptError> {
    if stack.len() < n {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(())
}

/// EvalScript: 𝕊 × 𝒮𝒯 × ℱ × 𝒱 → 𝒮𝒯 ∪ {⊥}
///
/// Executes `script` on `stack`:
/// 1. Reject scripts over the size limit (legacy and witness v0 only)
/// 2. For each operation:
///    - pushes over 520 bytes fail
///    - more than 201 non-push operations fail (legacy and witness v0 only)
///    - disabled opcodes fail even when not executed
///    - operations inside a false branch are skipped except IF/ELSE/ENDIF
///    - main plus alt stack may not exceed 1000 elements
/// 3. Every IF must be closed
pub fn eval_script(
    stack: &mut Vec<ByteString>,
    script: &[u8],
    flags: VerificationFlags,
    checker: &dyn SignatureChecker,
    sigversion: SigVersion,
    execdata: &mut ExecutionData,
) -> Result<(), ScriptError> {
    let legacy_limits = matches!(sigversion, SigVersion::Base | SigVersion::WitnessV0);
    if legacy_limits && script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let require_minimal = flags.contains(VerificationFlags::MINIMALDATA);
    let mut exec_stack = ConditionStack::new();
    let mut altstack: Vec<ByteString> = Vec::new();
    let mut op_count = 0usize;
    let mut code_begin = 0usize;
    let mut opcode_pos: u32 = 0;
    let mut pc = 0usize;
    execdata.codeseparator_pos = u32::MAX;

    while pc < script.len() {
        let executing = exec_stack.all_true();
        let (opcode, push, next) = next_op(script, pc).ok_or(ScriptError::BadOpcode)?;
        pc = next;

        if push.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        if legacy_limits && opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode);
        }

        if executing && opcode <= OP_PUSHDATA4 {
            if require_minimal && !check_minimal_push(push, opcode) {
                return Err(ScriptError::MinimalData);
            }
            stack.push(push.to_vec());
        } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let value = opcode as i64 - (OP_1 as i64 - 1);
                    stack.push(ScriptNum::new(value).to_bytes());
                }

                // ---- control ----
                OP_NOP => {}
                OP_CHECKLOCKTIMEVERIFY => {
                    if !flags.contains(VerificationFlags::CHECKLOCKTIMEVERIFY) {
                        discourage_nop(flags)?;
                    } else {
                        let lock_time =
                            ScriptNum::from_bytes(stack_top(stack, 1)?, require_minimal, LOCKTIME_SCRIPT_NUM_SIZE)?;
                        if lock_time.value() < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if !checker.check_lock_time(lock_time.value()) {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_CHECKSEQUENCEVERIFY => {
                    if !flags.contains(VerificationFlags::CHECKSEQUENCEVERIFY) {
                        discourage_nop(flags)?;
                    } else {
                        let sequence =
                            ScriptNum::from_bytes(stack_top(stack, 1)?, require_minimal, LOCKTIME_SCRIPT_NUM_SIZE)?;
                        if sequence.value() < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        // disabled relative lock: behaves as a NOP
                        if sequence.value() & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 == 0
                            && !checker.check_sequence(sequence.value())
                        {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_NOP1 | OP_NOP4..=OP_NOP10 => discourage_nop(flags)?,

                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let top = stack.last().ok_or(ScriptError::UnbalancedConditional)?;
                        let minimal = top.is_empty() || (top.len() == 1 && top[0] == 1);
                        if sigversion == SigVersion::Tapscript && !minimal {
                            return Err(ScriptError::TapscriptMinimalIf);
                        }
                        if sigversion == SigVersion::WitnessV0
                            && flags.contains(VerificationFlags::MINIMALIF)
                            && !minimal
                        {
                            return Err(ScriptError::MinimalIf);
                        }
                        value = cast_to_bool(top);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                        stack.pop();
                    }
                    exec_stack.push(value);
                }
                OP_ELSE => {
                    if exec_stack.is_empty() {
                        return Err(ScriptError::UnbalancedConditional);
                    }
                    exec_stack.toggle_top();
                }
                OP_ENDIF => {
                    if exec_stack.is_empty() {
                        return Err(ScriptError::UnbalancedConditional);
                    }
                    exec_stack.pop();
                }
                OP_VERIFY => {
                    if !cast_to_bool(stack_top(stack, 1)?) {
                        return Err(ScriptError::Verify);
                    }
                    stack.pop();
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                // ---- stack ----
                OP_TOALTSTACK => {
                    let item = pop(stack)?;
                    altstack.push(item);
                }
                OP_FROMALTSTACK => {
                    let item = altstack.pop().ok_or(ScriptError::InvalidAltstackOperation)?;
                    stack.push(item);
                }
                OP_2DROP => {
                    require(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    require(stack, 2)?;
                    let a = stack[stack.len() - 2].clone();
                    let b = stack[stack.len() - 1].clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_3DUP => {
                    require(stack, 3)?;
                    let start = stack.len() - 3;
                    for i in 0..3 {
                        let item = stack[start + i].clone();
                        stack.push(item);
                    }
                }
                OP_2OVER => {
                    require(stack, 4)?;
                    let a = stack[stack.len() - 4].clone();
                    let b = stack[stack.len() - 3].clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_2ROT => {
                    require(stack, 6)?;
                    let start = stack.len() - 6;
                    let moved: Vec<ByteString> = stack.drain(start..start + 2).collect();
                    stack.extend(moved);
                }
                OP_2SWAP => {
                    require(stack, 4)?;
                    let len = stack.len();
                    stack.swap(len - 4, len - 2);
                    stack.swap(len - 3, len - 1);
                }
                OP_IFDUP => {
                    let top = stack_top(stack, 1)?.clone();
                    if cast_to_bool(&top) {
                        stack.push(top);
                    }
                }
                OP_DEPTH => {
                    let depth = ScriptNum::new(stack.len() as i64);
                    stack.push(depth.to_bytes());
                }
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let top = stack_top(stack, 1)?.clone();
                    stack.push(top);
                }
                OP_NIP => {
                    require(stack, 2)?;
                    let idx = stack.len() - 2;
                    stack.remove(idx);
                }
                OP_OVER => {
                    let item = stack_top(stack, 2)?.clone();
                    stack.push(item);
                }
                OP_PICK | OP_ROLL => {
                    let n = ScriptNum::from_bytes(stack_top(stack, 1)?, require_minimal, DEFAULT_SCRIPT_NUM_SIZE)?
                        .to_i32();
                    stack.pop();
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let idx = stack.len() - 1 - n as usize;
                    let item = if opcode == OP_ROLL {
                        stack.remove(idx)
                    } else {
                        stack[idx].clone()
                    };
                    stack.push(item);
                }
                OP_ROT => {
                    require(stack, 3)?;
                    let idx = stack.len() - 3;
                    let item = stack.remove(idx);
                    stack.push(item);
                }
                OP_SWAP => {
                    require(stack, 2)?;
                    let len = stack.len();
                    stack.swap(len - 2, len - 1);
                }
                OP_TUCK => {
                    require(stack, 2)?;
                    let top = stack[stack.len() - 1].clone();
                    let idx = stack.len() - 2;
                    stack.insert(idx, top);
                }
                OP_SIZE => {
                    let size = ScriptNum::new(stack_top(stack, 1)?.len() as i64);
                    stack.push(size.to_bytes());
                }

                // ---- bitwise ----
                OP_EQUAL | OP_EQUALVERIFY => {
                    require(stack, 2)?;
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        stack.push(bool_bytes(equal));
                    }
                }

                // ---- arithmetic ----
                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = ScriptNum::from_bytes(stack_top(stack, 1)?, require_minimal, DEFAULT_SCRIPT_NUM_SIZE)?
                        .value();
                    let result = match opcode {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.pop();
                    stack.push(ScriptNum::new(result).to_bytes());
                }
                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY | OP_NUMNOTEQUAL
                | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    require(stack, 2)?;
                    let a = ScriptNum::from_bytes(stack_top(stack, 2)?, require_minimal, DEFAULT_SCRIPT_NUM_SIZE)?
                        .value();
                    let b = ScriptNum::from_bytes(stack_top(stack, 1)?, require_minimal, DEFAULT_SCRIPT_NUM_SIZE)?
                        .value();
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    stack.truncate(stack.len() - 2);
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::NumEqualVerify);
                        }
                    } else {
                        stack.push(ScriptNum::new(result).to_bytes());
                    }
                }
                OP_WITHIN => {
                    require(stack, 3)?;
                    let x = ScriptNum::from_bytes(stack_top(stack, 3)?, require_minimal, DEFAULT_SCRIPT_NUM_SIZE)?;
                    let min = ScriptNum::from_bytes(stack_top(stack, 2)?, require_minimal, DEFAULT_SCRIPT_NUM_SIZE)?;
                    let max = ScriptNum::from_bytes(stack_top(stack, 1)?, require_minimal, DEFAULT_SCRIPT_NUM_SIZE)?;
                    stack.truncate(stack.len() - 3);
                    stack.push(bool_bytes(min <= x && x < max));
                }

                // ---- crypto ----
                OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                    let item = pop(stack)?;
                    let digest = match opcode {
                        OP_RIPEMD160 => hashes::ripemd160(&item).to_vec(),
                        OP_SHA1 => hashes::sha1(&item).to_vec(),
                        OP_SHA256 => hashes::sha256(&item).to_vec(),
                        OP_HASH160 => hashes::hash160(&item).to_vec(),
                        _ => hashes::sha256d(&item).to_vec(),
                    };
                    stack.push(digest);
                }
                OP_CODESEPARATOR => {
                    code_begin = pc;
                    execdata.codeseparator_pos = opcode_pos;
                }
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    require(stack, 2)?;
                    let sig = stack[stack.len() - 2].clone();
                    let pubkey = stack[stack.len() - 1].clone();
                    let success = eval_checksig(
                        &sig,
                        &pubkey,
                        &script[code_begin..],
                        execdata,
                        flags,
                        checker,
                        sigversion,
                    )?;
                    stack.truncate(stack.len() - 2);
                    if opcode == OP_CHECKSIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(bool_bytes(success));
                    }
                }
                OP_CHECKSIGADD => {
                    if legacy_limits {
                        return Err(ScriptError::BadOpcode);
                    }
                    require(stack, 3)?;
                    let sig = stack[stack.len() - 3].clone();
                    let n = ScriptNum::from_bytes(stack_top(stack, 2)?, require_minimal, DEFAULT_SCRIPT_NUM_SIZE)?;
                    let pubkey = stack[stack.len() - 1].clone();
                    let success = eval_checksig(
                        &sig,
                        &pubkey,
                        &script[code_begin..],
                        execdata,
                        flags,
                        checker,
                        sigversion,
                    )?;
                    stack.truncate(stack.len() - 3);
                    stack.push(ScriptNum::new(n.value() + success as i64).to_bytes());
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    if sigversion == SigVersion::Tapscript {
                        return Err(ScriptError::TapscriptCheckMultiSig);
                    }
                    let success = eval_checkmultisig(
                        stack,
                        &script[code_begin..],
                        flags,
                        checker,
                        sigversion,
                        &mut op_count,
                    )?;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckMultiSigVerify);
                        }
                    } else {
                        stack.push(bool_bytes(success));
                    }
                }

                _ => return Err(ScriptError::BadOpcode),
            }
        }

        if stack.len() + altstack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
        opcode_pos = opcode_pos.wrapping_add(1);
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn discourage_nop(flags: VerificationFlags) -> Result<(), ScriptError> {
    if flags.contains(VerificationFlags::DISCOURAGE_UPGRADABLE_NOPS) {
        return Err(ScriptError::DiscourageUpgradableNops);
    }
    Ok(())
}

fn eval_checksig(
    sig: &[u8],
    pubkey: &[u8],
    script_code: &[u8],
    execdata: &mut ExecutionData,
    flags: VerificationFlags,
    checker: &dyn SignatureChecker,
    sigversion: SigVersion,
) -> Result<bool, ScriptError> {
    match sigversion {
        SigVersion::Base | SigVersion::WitnessV0 => {
            let mut script_code = script_code.to_vec();
            if sigversion == SigVersion::Base {
                let mut pushed = Vec::with_capacity(sig.len() + 5);
                push_data(&mut pushed, sig);
                find_and_delete(&mut script_code, &pushed);
            }
            signature::check_signature_encoding(sig, flags)?;
            signature::check_pubkey_encoding(pubkey, flags)?;
            let success = checker.check_ecdsa_signature(sig, pubkey, &script_code, sigversion);
            if !success && flags.contains(VerificationFlags::NULLFAIL) && !sig.is_empty() {
                return Err(ScriptError::SigNullFail);
            }
            Ok(success)
        }
        SigVersion::Tapscript => {
            let success = !sig.is_empty();
            if success {
                let budget = execdata
                    .validation_weight_left
                    .as_mut()
                    .ok_or(ScriptError::TapscriptValidationWeight)?;
                *budget -= VALIDATION_WEIGHT_PER_SIGOP_PASSED;
                if *budget < 0 {
                    return Err(ScriptError::TapscriptValidationWeight);
                }
            }
            match pubkey.len() {
                0 => return Err(ScriptError::PubkeyType),
                32 => {
                    if success {
                        checker.check_schnorr_signature(sig, pubkey, sigversion, execdata)?;
                    }
                }
                // unknown public key types are reserved for upgrades and succeed
                _ => {}
            }
            Ok(success)
        }
        SigVersion::Taproot => Err(ScriptError::BadOpcode),
    }
}

/// CHECKMULTISIG: <dummy> <sig>... <m> <pubkey>... <n>
fn eval_checkmultisig(
    stack: &mut Vec<ByteString>,
    script_code: &[u8],
    flags: VerificationFlags,
    checker: &dyn SignatureChecker,
    sigversion: SigVersion,
    op_count: &mut usize,
) -> Result<bool, ScriptError> {
    let require_minimal = flags.contains(VerificationFlags::MINIMALDATA);

    let mut i = 1usize;
    let keys_count =
        ScriptNum::from_bytes(stack_top(stack, i)?, require_minimal, DEFAULT_SCRIPT_NUM_SIZE)?.to_i32();
    if keys_count < 0 || keys_count as usize > MAX_PUBKEYS_PER_MULTISIG {
        return Err(ScriptError::PubkeyCount);
    }
    let mut keys_left = keys_count as usize;
    *op_count += keys_left;
    if *op_count > MAX_OPS_PER_SCRIPT {
        return Err(ScriptError::OpCount);
    }
    i += 1;
    let mut ikey = i;
    // keys that still count toward NULLFAIL cleanup
    let mut ikey2 = keys_left + 2;
    i += keys_left;
    let sigs_count =
        ScriptNum::from_bytes(stack_top(stack, i)?, require_minimal, DEFAULT_SCRIPT_NUM_SIZE)?.to_i32();
    if sigs_count < 0 || sigs_count as usize > keys_left {
        return Err(ScriptError::SigCount);
    }
    let mut sigs_left = sigs_count as usize;
    i += 1;
    let mut isig = i;
    i += sigs_left;
    require(stack, i)?;

    let mut script_code = script_code.to_vec();
    if sigversion == SigVersion::Base {
        for k in 0..sigs_left {
            let mut pushed = Vec::new();
            push_data(&mut pushed, stack_top(stack, isig + k)?);
            find_and_delete(&mut script_code, &pushed);
        }
    }

    let mut success = true;
    while success && sigs_left > 0 {
        let sig = stack_top(stack, isig)?;
        let pubkey = stack_top(stack, ikey)?;
        signature::check_signature_encoding(sig, flags)?;
        signature::check_pubkey_encoding(pubkey, flags)?;
        if checker.check_ecdsa_signature(sig, pubkey, &script_code, sigversion) {
            isig += 1;
            sigs_left -= 1;
        }
        ikey += 1;
        keys_left -= 1;
        // more signatures than keys left means failure
        if sigs_left > keys_left {
            success = false;
        }
    }

    // clean up the stack; everything but the dummy element
    while i > 1 {
        i -= 1;
        if !success
            && flags.contains(VerificationFlags::NULLFAIL)
            && ikey2 == 0
            && !stack_top(stack, 1)?.is_empty()
        {
            return Err(ScriptError::SigNullFail);
        }
        if ikey2 > 0 {
            ikey2 -= 1;
        }
        stack.pop();
    }

    // the extra dummy element consumed by the original off-by-one
    let dummy = stack_top(stack, 1)?;
    if flags.contains(VerificationFlags::NULLDUMMY) && !dummy.is_empty() {
        return Err(ScriptError::SigNullDummy);
    }
    stack.pop();
    Ok(success)
}

/// VerifyScript: 𝕊 × 𝕊 × 𝒲 × ℱ × 𝒱 → {⊤, ⊥}
///
/// 1. Run scriptSig, then scriptPubKey on the resulting stack; top must be true
/// 2. With WITNESS, a witness program scriptPubKey requires an empty scriptSig
///    and is verified against the witness
/// 3. With P2SH, a P2SH scriptPubKey runs the serialized redeem script on the
///    scriptSig stack, which may itself wrap a witness program
/// 4. With CLEANSTACK exactly one element may remain
/// 5. A witness on an input that never reached a witness program fails
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &Witness,
    flags: VerificationFlags,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    if flags.contains(VerificationFlags::SIGPUSHONLY) && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut execdata = ExecutionData::default();
    let mut stack: Vec<ByteString> = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker, SigVersion::Base, &mut execdata)?;
    let stack_copy = if flags.contains(VerificationFlags::P2SH) {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(&mut stack, script_pubkey, flags, checker, SigVersion::Base, &mut execdata)?;
    match stack.last() {
        Some(top) if cast_to_bool(top) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    let mut had_witness = false;
    if flags.contains(VerificationFlags::WITNESS) {
        if let Some((version, program)) = segwit::witness_program(script_pubkey) {
            had_witness = true;
            if !script_sig.is_empty() {
                return Err(ScriptError::WitnessMalleated);
            }
            segwit::verify_witness_program(witness, version, program, flags, checker, false)?;
            // witness programs bypass the cleanstack check
            stack.truncate(1);
        }
    }

    if flags.contains(VerificationFlags::P2SH) && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_copy;
        let redeem_script = pop(&mut stack).map_err(|_| ScriptError::EvalFalse)?;
        eval_script(&mut stack, &redeem_script, flags, checker, SigVersion::Base, &mut execdata)?;
        match stack.last() {
            Some(top) if cast_to_bool(top) => {}
            _ => return Err(ScriptError::EvalFalse),
        }

        if flags.contains(VerificationFlags::WITNESS) {
            if let Some((version, program)) = segwit::witness_program(&redeem_script) {
                had_witness = true;
                let mut expected = Vec::with_capacity(redeem_script.len() + 1);
                push_data(&mut expected, &redeem_script);
                if script_sig != expected.as_slice() {
                    return Err(ScriptError::WitnessMalleatedP2SH);
                }
                segwit::verify_witness_program(witness, version, program, flags, checker, true)?;
                stack.truncate(1);
            }
        }
    }

    if flags.contains(VerificationFlags::CLEANSTACK) && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }

    if flags.contains(VerificationFlags::WITNESS) && !had_witness && !witness.is_empty() {
        return Err(ScriptError::WitnessUnexpected);
    }
    Ok(())
}

/// Verify that input `input_index` of `tx` may spend an output locked by
/// `script_pubkey` holding `amount`.
///
/// `Ok(false)` means the script failed. `Err` means the request itself was
/// malformed: unknown or inconsistent flags, an input index out of range, or
/// TAPROOT requested without the spent outputs in `txdata`.
pub fn verify_script_pubkey(
    script_pubkey: &[u8],
    amount: i64,
    tx: &Transaction,
    txdata: &PrecomputedTransactionData,
    input_index: usize,
    flags: u32,
) -> crate::error::Result<bool> {
    let flags = VerificationFlags::from_bits(flags)?;
    flags.check_combination()?;
    if input_index >= tx.inputs.len() {
        return Err(ScriptVerifyError::InputIndexOutOfRange {
            index: input_index,
            inputs: tx.inputs.len(),
        }
        .into());
    }
    if flags.contains(VerificationFlags::TAPROOT) && !txdata.has_spent_outputs() {
        return Err(ScriptVerifyError::SpentOutputsRequired.into());
    }

    let input = &tx.inputs[input_index];
    let checker = TransactionSignatureChecker::new(tx, input_index, amount, txdata);
    match verify_script(&input.script_sig, script_pubkey, &input.witness, flags, &checker) {
        Ok(()) => Ok(true),
        Err(err) => {
            tracing::debug!("script verification failed for input {}: {}", input_index, err);
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConsensusError;
    use crate::signature::NullSignatureChecker;
    // Not exported by crate::opcodes (which only names OP_1..OP_3 and OP_16).
    const OP_4: u8 = 0x54;

    fn run(script: &[u8], flags: VerificationFlags) -> (Result<(), ScriptError>, Vec<ByteString>) {
        let mut stack = Vec::new();
        let mut execdata = ExecutionData::default();
        let result = eval_script(
            &mut stack,
            script,
            flags,
            &NullSignatureChecker,
            SigVersion::Base,
            &mut execdata,
        );
        (result, stack)
    }

    fn eval(script: &[u8]) -> (Result<(), ScriptError>, Vec<ByteString>) {
        run(script, VerificationFlags::NONE)
    }

    // ============================================================================
    // SCRIPT NUMBERS
    // ============================================================================

    #[test]
    fn test_script_num_encoding() {
        let cases: [(i64, &[u8]); 7] = [
            (0, &[]),
            (1, &[0x01]),
            (-1, &[0x81]),
            (127, &[0x7f]),
            (128, &[0x80, 0x00]),
            (-128, &[0x80, 0x80]),
            (255, &[0xff, 0x00]),
        ];
        for (value, bytes) in cases {
            assert_eq!(ScriptNum::new(value).to_bytes(), bytes);
            assert_eq!(ScriptNum::from_bytes(bytes, true, 4).unwrap().value(), value);
        }
    }

    #[test]
    fn test_script_num_overflow() {
        assert_eq!(
            ScriptNum::from_bytes(&[1, 2, 3, 4, 5], false, 4),
            Err(ScriptError::ScriptNumOverflow)
        );
        assert!(ScriptNum::from_bytes(&[1, 2, 3, 4, 5], false, 5).is_ok());
    }

    #[test]
    fn test_script_num_minimal() {
        assert_eq!(
            ScriptNum::from_bytes(&[0x01, 0x00], true, 4),
            Err(ScriptError::ScriptNumNotMinimal)
        );
        assert_eq!(ScriptNum::from_bytes(&[0x01, 0x00], false, 4).unwrap().value(), 1);
        assert_eq!(
            ScriptNum::from_bytes(&[0x80], true, 4),
            Err(ScriptError::ScriptNumNotMinimal)
        );
    }

    #[test]
    fn test_cast_to_bool() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0x00, 0x00]));
        assert!(!cast_to_bool(&[0x00, 0x80]));
        assert!(cast_to_bool(&[0x80, 0x00]));
        assert!(cast_to_bool(&[0x01]));
    }

    // ============================================================================
    // PARSING
    // ============================================================================

    #[test]
    fn test_next_op_pushdata() {
        let script = [OP_PUSHDATA1, 2, 0xaa, 0xbb, OP_DUP];
        let (opcode, data, next) = next_op(&script, 0).unwrap();
        assert_eq!(opcode, OP_PUSHDATA1);
        assert_eq!(data, &[0xaa, 0xbb]);
        assert_eq!(next_op(&script, next).unwrap().0, OP_DUP);
        assert!(next_op(&[0x05, 0x01], 0).is_none());
    }

    #[test]
    fn test_find_and_delete() {
        let mut script = vec![0x02, 0xaa, 0xbb, OP_DUP, 0x02, 0xaa, 0xbb];
        assert_eq!(find_and_delete(&mut script, &[0x02, 0xaa, 0xbb]), 2);
        assert_eq!(script, vec![OP_DUP]);

        // matches inside push data are not removed
        let mut script = vec![0x03, 0x02, 0xaa, 0xbb];
        assert_eq!(find_and_delete(&mut script, &[0x02, 0xaa, 0xbb]), 0);
        assert_eq!(script.len(), 4);
    }

    #[test]
    fn test_push_only_and_p2sh() {
        assert!(is_push_only(&[OP_1, 0x01, 0x05, OP_16]));
        assert!(!is_push_only(&[OP_1, OP_DUP]));
        let mut p2sh = vec![OP_HASH160, 0x14];
        p2sh.extend_from_slice(&[0u8; 20]);
        p2sh.push(OP_EQUAL);
        assert!(is_p2sh(&p2sh));
    }

    #[test]
    fn test_minimal_push() {
        assert!(check_minimal_push(&[], OP_0));
        assert!(!check_minimal_push(&[5], 0x01));
        assert!(check_minimal_push(&[5], OP_1 + 4));
        assert!(check_minimal_push(&[0x81], OP_1NEGATE));
        assert!(!check_minimal_push(&[0u8; 10], OP_PUSHDATA1));
    }

    // ============================================================================
    // OPCODES
    // ============================================================================

    #[test]
    fn test_small_ints() {
        let (result, stack) = eval(&[OP_1NEGATE, OP_0, OP_16]);
        assert!(result.is_ok());
        assert_eq!(stack, vec![vec![0x81], vec![], vec![16]]);
    }

    #[test]
    fn test_arithmetic() {
        let script = ScriptBuilder::new()
            .push_int(1000)
            .push_int(-3)
            .push_opcode(OP_ADD)
            .push_int(997)
            .push_opcode(OP_NUMEQUAL)
            .into_bytes();
        let (result, stack) = eval(&script);
        assert!(result.is_ok());
        assert_eq!(stack, vec![vec![1]]);
    }

    #[test]
    fn test_arithmetic_overflow_operand() {
        // 5-byte operands are rejected by arithmetic opcodes
        let script = ScriptBuilder::new()
            .push_slice(&[0xff, 0xff, 0xff, 0xff, 0x00])
            .push_opcode(OP_1ADD)
            .into_bytes();
        assert_eq!(eval(&script).0, Err(ScriptError::ScriptNumOverflow));
    }

    #[test]
    fn test_within_and_minmax() {
        let script = ScriptBuilder::new()
            .push_int(5)
            .push_int(2)
            .push_int(6)
            .push_opcode(OP_WITHIN)
            .into_bytes();
        assert_eq!(eval(&script).1, vec![vec![1]]);
        let script = [OP_2, OP_3, OP_MIN, OP_2, OP_3, OP_MAX];
        assert_eq!(eval(&script).1, vec![vec![2], vec![3]]);
    }

    #[test]
    fn test_stack_ops() {
        let (result, stack) = eval(&[OP_1, OP_2, OP_3, OP_ROT]);
        assert!(result.is_ok());
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);

        let (_, stack) = eval(&[OP_1, OP_2, OP_TUCK]);
        assert_eq!(stack, vec![vec![2], vec![1], vec![2]]);

        let (_, stack) = eval(&[OP_1, OP_2, OP_3, OP_2, OP_ROLL]);
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);

        let (_, stack) = eval(&[OP_1, OP_2, OP_3, OP_4, OP_2SWAP]);
        assert_eq!(stack, vec![vec![3], vec![4], vec![1], vec![2]]);
    }

    #[test]
    fn test_stack_underflow() {
        assert_eq!(eval(&[OP_DUP]).0, Err(ScriptError::InvalidStackOperation));
        assert_eq!(eval(&[OP_1, OP_SWAP]).0, Err(ScriptError::InvalidStackOperation));
        assert_eq!(eval(&[OP_FROMALTSTACK]).0, Err(ScriptError::InvalidAltstackOperation));
        assert_eq!(eval(&[OP_1, OP_1, OP_PICK]).0, Err(ScriptError::InvalidStackOperation));
    }

    #[test]
    fn test_conditionals() {
        let (result, stack) = eval(&[OP_1, OP_IF, OP_2, OP_ELSE, OP_3, OP_ENDIF]);
        assert!(result.is_ok());
        assert_eq!(stack, vec![vec![2]]);

        let (_, stack) = eval(&[OP_0, OP_IF, OP_2, OP_ELSE, OP_3, OP_ENDIF]);
        assert_eq!(stack, vec![vec![3]]);

        let (_, stack) = eval(&[OP_0, OP_NOTIF, OP_1, OP_IF, OP_4, OP_ENDIF, OP_ENDIF]);
        assert_eq!(stack, vec![vec![4]]);

        assert_eq!(eval(&[OP_1, OP_IF]).0, Err(ScriptError::UnbalancedConditional));
        assert_eq!(eval(&[OP_ENDIF]).0, Err(ScriptError::UnbalancedConditional));
    }

    #[test]
    fn test_disabled_opcode_in_unexecuted_branch() {
        let script = [OP_0, OP_IF, OP_CAT, OP_ENDIF, OP_1];
        assert_eq!(eval(&script).0, Err(ScriptError::DisabledOpcode));
    }

    #[test]
    fn test_verif_fails_in_unexecuted_branch() {
        let script = [OP_0, OP_IF, OP_VERIF, OP_ENDIF, OP_1];
        assert_eq!(eval(&script).0, Err(ScriptError::BadOpcode));
        // OP_RESERVED only fails when executed
        let script = [OP_0, OP_IF, OP_RESERVED, OP_ENDIF, OP_1];
        assert!(eval(&script).0.is_ok());
    }

    #[test]
    fn test_op_return() {
        assert_eq!(eval(&[OP_1, OP_RETURN]).0, Err(ScriptError::OpReturn));
    }

    #[test]
    fn test_hash_ops() {
        let (result, stack) = eval(&[OP_0, OP_SHA256]);
        assert!(result.is_ok());
        assert_eq!(
            hex::encode(&stack[0]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let (_, stack) = eval(&[OP_0, OP_HASH160]);
        assert_eq!(stack[0].len(), 20);
    }

    #[test]
    fn test_limits() {
        let big = vec![OP_NOP; MAX_SCRIPT_SIZE + 1];
        assert_eq!(eval(&big).0, Err(ScriptError::ScriptSize));

        let ops = vec![OP_NOP; MAX_OPS_PER_SCRIPT + 1];
        assert_eq!(eval(&ops).0, Err(ScriptError::OpCount));

        let pushes = vec![OP_1; MAX_STACK_SIZE + 1];
        assert_eq!(eval(&pushes).0, Err(ScriptError::StackSize));

        let mut oversized = vec![OP_PUSHDATA2];
        oversized.extend_from_slice(&521u16.to_le_bytes());
        oversized.extend_from_slice(&[0u8; 521]);
        assert_eq!(eval(&oversized).0, Err(ScriptError::PushSize));
    }

    #[test]
    fn test_minimaldata_flag() {
        let non_minimal = [0x01, 0x05];
        assert!(eval(&non_minimal).0.is_ok());
        assert_eq!(
            run(&non_minimal, VerificationFlags::MINIMALDATA).0,
            Err(ScriptError::MinimalData)
        );
    }

    #[test]
    fn test_checklocktime_without_flag_is_nop() {
        let script = [OP_1NEGATE, OP_CHECKLOCKTIMEVERIFY];
        assert!(eval(&script).0.is_ok());
        assert_eq!(
            run(&script, VerificationFlags::CHECKLOCKTIMEVERIFY).0,
            Err(ScriptError::NegativeLocktime)
        );
        assert_eq!(
            run(&[OP_NOP4], VerificationFlags::DISCOURAGE_UPGRADABLE_NOPS).0,
            Err(ScriptError::DiscourageUpgradableNops)
        );
    }

    #[test]
    fn test_checkmultisig_zero_of_zero() {
        let (result, stack) = eval(&[OP_0, OP_0, OP_0, OP_CHECKMULTISIG]);
        assert!(result.is_ok());
        assert_eq!(stack, vec![vec![1]]);
        // dummy must be empty with NULLDUMMY
        let script = [OP_1, OP_0, OP_0, OP_CHECKMULTISIG];
        assert_eq!(run(&script, VerificationFlags::NULLDUMMY).0, Err(ScriptError::SigNullDummy));
    }

    #[test]
    fn test_checksig_fails_without_transaction() {
        let script = ScriptBuilder::new()
            .push_slice(&[0x30])
            .push_slice(&[0x02; 33])
            .push_opcode(OP_CHECKSIG)
            .into_bytes();
        let (result, stack) = eval(&script);
        assert!(result.is_ok());
        assert_eq!(stack, vec![Vec::<u8>::new()]);
        assert_eq!(run(&script, VerificationFlags::NULLFAIL).0, Err(ScriptError::SigNullFail));
    }

    // ============================================================================
    // VERIFY SCRIPT
    // ============================================================================

    #[test]
    fn test_verify_script_simple() {
        let checker = NullSignatureChecker;
        assert!(verify_script(&[OP_1], &[OP_1, OP_EQUAL], &vec![], VerificationFlags::NONE, &checker).is_ok());
        assert_eq!(
            verify_script(&[OP_1], &[OP_2, OP_EQUAL], &vec![], VerificationFlags::NONE, &checker),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn test_verify_p2sh() {
        let redeem = vec![OP_2, OP_EQUAL];
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&hashes::hash160(&redeem));
        script_pubkey.push(OP_EQUAL);
        let script_sig = ScriptBuilder::new().push_int(2).push_slice(&redeem).into_bytes();
        let checker = NullSignatureChecker;
        assert!(verify_script(&script_sig, &script_pubkey, &vec![], VerificationFlags::P2SH, &checker).is_ok());

        let wrong = ScriptBuilder::new().push_int(3).push_slice(&redeem).into_bytes();
        assert!(verify_script(&wrong, &script_pubkey, &vec![], VerificationFlags::P2SH, &checker).is_err());
        // without the flag only the hash is checked
        assert!(verify_script(&wrong, &script_pubkey, &vec![], VerificationFlags::NONE, &checker).is_ok());

        // P2SH scriptSig must be push only
        let mut not_push = wrong.clone();
        not_push.insert(0, OP_NOP);
        assert_eq!(
            verify_script(&not_push, &script_pubkey, &vec![], VerificationFlags::P2SH, &checker),
            Err(ScriptError::SigPushOnly)
        );
    }

    #[test]
    fn test_cleanstack() {
        let checker = NullSignatureChecker;
        let flags = VerificationFlags::P2SH | VerificationFlags::WITNESS | VerificationFlags::CLEANSTACK;
        assert_eq!(
            verify_script(&[OP_1, OP_1], &[OP_NOP], &vec![], flags, &checker),
            Err(ScriptError::CleanStack)
        );
    }

    #[test]
    fn test_flag_combinations() {
        assert!(VerificationFlags::ALL.check_combination().is_ok());
        assert_eq!(
            VerificationFlags::WITNESS.check_combination(),
            Err(ScriptVerifyError::InvalidFlagsCombination)
        );
        assert_eq!(
            (VerificationFlags::P2SH | VerificationFlags::CLEANSTACK).check_combination(),
            Err(ScriptVerifyError::InvalidFlagsCombination)
        );
        assert_eq!(
            VerificationFlags::from_bits(1 << 12),
            Err(ScriptVerifyError::UnknownFlags(1 << 12))
        );
    }

    #[test]
    fn test_verify_script_pubkey_request_errors() {
        let tx = Transaction {
            version: 2,
            inputs: vec![TransactionInput {
                prevout: OutPoint::new(Txid([1; 32]), 0),
                script_sig: vec![],
                sequence: SEQUENCE_FINAL,
                witness: vec![],
            }],
            outputs: vec![],
            lock_time: 0,
        };
        let txdata = PrecomputedTransactionData::new(&tx, vec![]).unwrap();
        let spk = [OP_1];

        let err = verify_script_pubkey(&spk, 0, &tx, &txdata, 0, VerificationFlags::ALL.bits()).unwrap_err();
        assert_eq!(err, ConsensusError::ScriptVerify(ScriptVerifyError::SpentOutputsRequired));

        let err = verify_script_pubkey(&spk, 0, &tx, &txdata, 1, 0).unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::ScriptVerify(ScriptVerifyError::InputIndexOutOfRange { .. })
        ));

        let err = verify_script_pubkey(&spk, 0, &tx, &txdata, 0, VerificationFlags::WITNESS.bits()).unwrap_err();
        assert_eq!(err, ConsensusError::ScriptVerify(ScriptVerifyError::InvalidFlagsCombination));

        assert!(verify_script_pubkey(&spk, 0, &tx, &txdata, 0, VerificationFlags::P2SH.bits()).unwrap());
        assert!(!verify_script_pubkey(&[OP_0], 0, &tx, &txdata, 0, 0).unwrap());
    }
}
