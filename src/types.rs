//! Core Aureus types for consensus validation
//!
//! All entities are immutable value types. Blocks hold their transactions behind
//! [`Arc`] so that the block index, the coins layer and notification payloads can
//! share them without copying.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ConsensusError, Result};

/// Hash type: 256-bit digest in internal byte order
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Natural number type
pub type Natural = u64;

/// Integer type
pub type Integer = i64;

/// Witness stack of one input: 𝒲 = 𝕊*
pub type Witness = Vec<ByteString>;

macro_rules! hash_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        ///
        /// Stored in internal byte order, displayed byte-reversed as is customary.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(pub Hash);

        impl $name {
            pub const fn from_byte_array(bytes: Hash) -> Self {
                $name(bytes)
            }

            pub const fn all_zeros() -> Self {
                $name([0u8; 32])
            }

            pub fn to_byte_array(self) -> Hash {
                self.0
            }

            pub fn as_bytes(&self) -> &Hash {
                &self.0
            }

            pub fn is_null(&self) -> bool {
                self.0 == [0u8; 32]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut reversed = self.0;
                reversed.reverse();
                f.write_str(&hex::encode(reversed))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ConsensusError;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)
                    .map_err(|e| ConsensusError::Serialization(format!("invalid hex: {}", e)))?;
                if bytes.len() != 32 {
                    return Err(ConsensusError::Serialization(format!(
                        "expected 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                let mut hash = [0u8; 32];
                for (i, b) in bytes.iter().rev().enumerate() {
                    hash[i] = *b;
                }
                Ok($name(hash))
            }
        }

        impl From<Hash> for $name {
            fn from(bytes: Hash) -> Self {
                $name(bytes)
            }
        }
    };
}

hash_newtype!(Txid, "Transaction identifier: double-SHA256 of the non-witness serialization");
hash_newtype!(Wtxid, "Witness transaction identifier: double-SHA256 of the full serialization");
hash_newtype!(BlockHash, "Block identifier: double-SHA256 of the 80-byte header");

/// OutPoint: 𝒪 = ℍ × ℕ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Txid, index: u32) -> Self {
        OutPoint { txid, index }
    }

    /// The prevout carried by coinbase inputs
    pub fn null() -> Self {
        OutPoint {
            txid: Txid::all_zeros(),
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_null() && self.index == u32::MAX
    }
}

/// Transaction Input: ℐ = 𝒪 × 𝕊 × ℕ × 𝒲
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
    pub witness: Witness,
}

/// Transaction Output: 𝒯 = ℤ × 𝕊
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Integer,
    pub script_pubkey: ByteString,
}

/// Transaction: 𝒯𝒳 = ℤ × ℐ* × 𝒯* × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase has exactly one input spending the null prevout
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn txid(&self) -> Txid {
        crate::serialization::transaction::compute_txid(self)
    }

    pub fn wtxid(&self) -> Wtxid {
        crate::serialization::transaction::compute_wtxid(self)
    }

    /// Sum of output values, `None` on overflow
    pub fn total_output_value(&self) -> Option<Integer> {
        self.outputs
            .iter()
            .try_fold(0i64, |acc, output| acc.checked_add(output.value))
    }
}

/// Block Header: ℋ = ℤ × ℍ × ℍ × ℕ × ℕ × ℕ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: BlockHash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn block_hash(&self) -> BlockHash {
        crate::serialization::block::compute_block_hash(self)
    }
}

/// Block: ℬ = ℋ × 𝒯𝒳*
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Arc<Transaction>>,
}

impl Block {
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().map(|tx| tx.as_ref())
    }
}

/// Coin: 𝒞 = 𝒯 × ℕ × 𝔹
///
/// One unspent output plus the metadata needed for maturity checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub output: TransactionOutput,
    pub height: u32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn new(output: TransactionOutput, height: u32, is_coinbase: bool) -> Self {
        Coin {
            output,
            height,
            is_coinbase,
        }
    }
}

/// Coins consumed by one transaction, in input order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSpentOutputs {
    pub coins: Vec<Coin>,
}

/// Undo data of a block: one entry per non-coinbase transaction, in block order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpentOutputs {
    pub transactions: Vec<TransactionSpentOutputs>,
}

impl BlockSpentOutputs {
    pub fn count(&self) -> usize {
        self.transactions.len()
    }
}
