//! Proof of work: 256-bit targets, compact encoding, chain work and retargeting

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Not, Shl, Shr, Sub};

use crate::chain::BlockTreeEntry;
use crate::chainparams::ChainParams;
use crate::types::*;

/// 256-bit unsigned integer for target and chain work arithmetic
///
/// Little-endian limbs. Arithmetic wraps modulo 2^256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct U256([u64; 4]); // 4 * 64 = 256 bits

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const ONE: U256 = U256([1, 0, 0, 0]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    /// Build from little-endian 64-bit limbs
    pub const fn from_limbs(limbs: [u64; 4]) -> Self {
        U256(limbs)
    }

    pub fn zero() -> Self {
        U256::ZERO
    }

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn low_u64(&self) -> u64 {
        self.0[0]
    }

    /// Number of significant bits
    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    /// Interpret 32 little-endian bytes, e.g. a block hash in internal order
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(chunk);
        }
        U256(words)
    }

    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, &word) in self.0.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    fn bit(&self, index: u32) -> bool {
        (self.0[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    pub fn overflowing_add(self, rhs: Self) -> (Self, bool) {
        let mut result = [0u64; 4];
        let mut carry = false;
        for (i, limb) in result.iter_mut().enumerate() {
            let (sum, c1) = self.0[i].overflowing_add(rhs.0[i]);
            let (sum, c2) = sum.overflowing_add(carry as u64);
            *limb = sum;
            carry = c1 || c2;
        }
        (U256(result), carry)
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        match self.overflowing_add(rhs) {
            (value, false) => Some(value),
            (_, true) => None,
        }
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        if rhs >= self {
            U256::ZERO
        } else {
            self - rhs
        }
    }

    /// Multiply by a 64-bit value, wrapping
    pub fn mul_u64(self, rhs: u64) -> Self {
        let mut result = [0u64; 4];
        let mut carry: u128 = 0;
        for (i, limb) in result.iter_mut().enumerate() {
            let product = self.0[i] as u128 * rhs as u128 + carry;
            *limb = product as u64;
            carry = product >> 64;
        }
        U256(result)
    }

    /// Long division; division by zero yields zero
    fn div_rem(self, divisor: Self) -> (Self, Self) {
        if divisor.is_zero() {
            return (U256::ZERO, U256::ZERO);
        }
        if self < divisor {
            return (U256::ZERO, self);
        }
        let mut quotient = U256::ZERO;
        let mut remainder = U256::ZERO;
        for i in (0..self.bits()).rev() {
            remainder = remainder << 1;
            if self.bit(i) {
                remainder.0[0] |= 1;
            }
            if remainder >= divisor {
                remainder = remainder - divisor;
                quotient.0[(i / 64) as usize] |= 1 << (i % 64);
            }
        }
        (quotient, remainder)
    }

    /// Decode the compact "bits" form: returns (value, negative, overflow)
    ///
    /// The top byte is a base-256 exponent, the low 23 bits the mantissa and
    /// bit 23 a sign: value = mantissa × 256^(exponent − 3).
    pub fn from_compact(compact: u32) -> (Self, bool, bool) {
        let size = compact >> 24;
        let mut word = compact & 0x007f_ffff;
        let value = if size <= 3 {
            word >>= 8 * (3 - size);
            U256::from_u64(word as u64)
        } else {
            U256::from_u64(word as u64) << (8 * (size - 3))
        };
        let negative = word != 0 && (compact & 0x0080_0000) != 0;
        let overflow = word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
        (value, negative, overflow)
    }

    /// Encode into the compact form, rounding the mantissa down
    pub fn to_compact(&self) -> u32 {
        let mut size = (self.bits() + 7) / 8;
        let mut compact = if size <= 3 {
            (self.low_u64() << (8 * (3 - size))) as u32
        } else {
            (*self >> (8 * (size - 3))).low_u64() as u32
        };
        // the sign bit is set: shift the mantissa down and bump the exponent
        if compact & 0x0080_0000 != 0 {
            compact >>= 8;
            size += 1;
        }
        compact | (size << 24)
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for U256 {
    type Output = U256;

    fn add(self, rhs: Self) -> Self {
        self.overflowing_add(rhs).0
    }
}

impl Sub for U256 {
    type Output = U256;

    fn sub(self, rhs: Self) -> Self {
        // a - b = a + ~b + 1
        self.overflowing_add(!rhs).0.overflowing_add(U256::ONE).0
    }
}

impl Not for U256 {
    type Output = U256;

    fn not(self) -> Self {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }
}

impl Mul<u64> for U256 {
    type Output = U256;

    fn mul(self, rhs: u64) -> Self {
        self.mul_u64(rhs)
    }
}

impl Div for U256 {
    type Output = U256;

    fn div(self, rhs: Self) -> Self {
        self.div_rem(rhs).0
    }
}

impl Shl<u32> for U256 {
    type Output = U256;

    fn shl(self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }
        let mut result = U256::ZERO;
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }
        result
    }
}

impl Shr<u32> for U256 {
    type Output = U256;

    fn shr(self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }
        let mut result = U256::ZERO;
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > word_shift {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }
        result
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = self.to_le_bytes();
        bytes.reverse();
        f.write_str(&hex::encode(bytes))
    }
}

impl fmt::Debug for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U256(0x{})", self)
    }
}

/// DeriveTarget: ℕ × U256 → U256 ∪ {⊥}
///
/// Fails for negative, zero or overflowing encodings and targets above the limit.
pub fn derive_target(bits: u32, pow_limit: &U256) -> Option<U256> {
    let (target, negative, overflow) = U256::from_compact(bits);
    if negative || overflow || target.is_zero() || target > *pow_limit {
        return None;
    }
    Some(target)
}

/// CheckProofOfWork: ℍ × ℕ → {true, false}
///
/// The hash, read as a little-endian number, must not exceed the target.
pub fn check_proof_of_work(hash: &BlockHash, bits: u32, pow_limit: &U256) -> bool {
    match derive_target(bits, pow_limit) {
        Some(target) => U256::from_le_bytes(hash.as_bytes()) <= target,
        None => false,
    }
}

/// GetBlockProof: expected number of hashes for a target, 2^256 / (target + 1)
///
/// Computed as ~target / (target + 1) + 1 since 2^256 does not fit.
pub fn get_block_proof(bits: u32) -> U256 {
    let (target, negative, overflow) = U256::from_compact(bits);
    if negative || overflow || target.is_zero() {
        return U256::ZERO;
    }
    (!target / (target + U256::ONE)) + U256::ONE
}

/// GetNextWorkRequired: ℰ × ℋ → ℕ
///
/// 1. Off a retarget boundary the previous bits carry over, except on
///    networks with min-difficulty blocks: a block more than two spacings
///    after its parent may use the limit, otherwise the last non-limit bits
///    of the period apply
/// 2. On a boundary, retarget over the last interval
pub fn get_next_work_required(last: &BlockTreeEntry, header: &BlockHeader, params: &ChainParams) -> u32 {
    let pow_limit_bits = params.pow_limit.to_compact();
    let interval = params.difficulty_adjustment_interval();
    let next_height = last.height + 1;

    if next_height as i64 % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            if header.timestamp as i64 > last.header.timestamp as i64 + params.pow_target_spacing * 2 {
                return pow_limit_bits;
            }
            let mut entry = last;
            while let Some(parent) = entry.parent() {
                if entry.height as i64 % interval == 0 || entry.header.bits != pow_limit_bits {
                    break;
                }
                entry = parent;
            }
            return entry.header.bits;
        }
        return last.header.bits;
    }

    let first_height = last.height - (interval as u32 - 1);
    let first = match last.ancestor(first_height) {
        Some(first) => first,
        None => return last.header.bits,
    };
    calculate_next_work_required(last, first.header.timestamp as i64, first.header.bits, params)
}

/// CalculateNextWorkRequired
///
/// new = old × clamp(actual timespan, target/4, target×4) / target, capped at
/// the limit. With BIP94 the period's first bits are the base instead of the last.
pub fn calculate_next_work_required(
    last: &BlockTreeEntry,
    first_block_time: i64,
    first_block_bits: u32,
    params: &ChainParams,
) -> u32 {
    if params.pow_no_retargeting {
        return last.header.bits;
    }
    let timespan = params.pow_target_timespan;
    let actual = (last.header.timestamp as i64 - first_block_time).clamp(timespan / 4, timespan * 4);

    let base_bits = if params.enforce_bip94 {
        first_block_bits
    } else {
        last.header.bits
    };
    let (base, _, _) = U256::from_compact(base_bits);
    let mut target = base.mul_u64(actual as u64) / U256::from_u64(timespan as u64);
    if target > params.pow_limit {
        target = params.pow_limit;
    }
    target.to_compact()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_round_trip() {
        for bits in [0x1d00ffffu32, 0x207fffff, 0x1b0404cb, 0x170331db] {
            let (value, negative, overflow) = U256::from_compact(bits);
            assert!(!negative && !overflow);
            assert_eq!(value.to_compact(), bits);
        }
    }

    #[test]
    fn test_compact_edge_cases() {
        assert_eq!(U256::from_compact(0x01003456).0, U256::ZERO);
        assert_eq!(U256::from_compact(0x01123456).0, U256::from_u64(0x12));
        assert_eq!(U256::from_compact(0x04123456).0, U256::from_u64(0x12345600));
        let (_, negative, _) = U256::from_compact(0x04923456);
        assert!(negative);
        let (_, _, overflow) = U256::from_compact(0xff123456);
        assert!(overflow);
        assert_eq!(U256::from_u64(0x80).to_compact(), 0x02008000);
    }

    #[test]
    fn test_mainnet_genesis_target() {
        let (target, _, _) = U256::from_compact(0x1d00ffff);
        assert_eq!(
            target.to_string(),
            "00000000ffff0000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_block_proof() {
        // difficulty 1 target needs 2^32 + 2^16 + 1 ... hashes: 0x100010001
        assert_eq!(get_block_proof(0x1d00ffff), U256::from_u64(0x0001_0001_0001));
        assert_eq!(get_block_proof(0x207fffff), U256::from_u64(2));
        assert_eq!(get_block_proof(0), U256::ZERO);
    }

    #[test]
    fn test_arithmetic() {
        let a = U256::from_u64(u64::MAX);
        let b = a + U256::ONE;
        assert_eq!(b, U256([0, 1, 0, 0]));
        assert_eq!(b - U256::ONE, a);
        assert_eq!(b >> 64, U256::ONE);
        assert_eq!(U256::ONE << 64, b);
        assert_eq!((b.mul_u64(10)) / U256::from_u64(5), b.mul_u64(2));
        assert_eq!(U256::ZERO - U256::ONE, U256::MAX);
        assert_eq!(U256::from_u64(5).saturating_sub(U256::from_u64(9)), U256::ZERO);
        assert_eq!(U256::MAX.checked_add(U256::ONE), None);
    }

    #[test]
    fn test_bits_and_ordering() {
        assert_eq!(U256::ZERO.bits(), 0);
        assert_eq!(U256::ONE.bits(), 1);
        assert_eq!((U256::ONE << 200).bits(), 201);
        assert!(U256::ONE << 200 > U256::from_u64(u64::MAX));
    }

    #[test]
    fn test_derive_target_limits() {
        let (limit, _, _) = U256::from_compact(0x1d00ffff);
        assert!(derive_target(0x1d00ffff, &limit).is_some());
        assert!(derive_target(0x1d01ffff, &limit).is_none());
        assert!(derive_target(0, &limit).is_none());
        assert!(derive_target(0x04923456, &limit).is_none());
    }

    #[test]
    fn test_check_proof_of_work_hash_compare() {
        let limit = U256::MAX;
        let easy = BlockHash([0xff; 32]);
        assert!(!check_proof_of_work(&easy, 0x207fffff, &limit));
        let mut low = [0u8; 32];
        low[31] = 0x10; // most significant byte
        assert!(check_proof_of_work(&BlockHash(low), 0x207fffff, &limit));
    }
}
