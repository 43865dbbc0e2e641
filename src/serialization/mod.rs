//! Wire format serialization and deserialization
//!
//! Every entity of the data model has a deterministic binary form that must
//! round-trip byte for byte. All integers are little-endian, hashes are raw
//! 32-byte digests in internal order.

pub mod block;
pub mod transaction;
pub mod undo;
pub mod varint;

use thiserror::Error;

use crate::error::{ConsensusError, Result};
use crate::types::Hash;

pub use block::{deserialize_block_header, serialize_block_header};
pub use transaction::{deserialize_transaction, serialize_transaction};
pub use varint::{decode_varint, encode_varint};

/// Reasons a byte string fails to decode
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected end of data: needed {needed} more bytes")]
    InsufficientBytes { needed: usize },

    #[error("non-canonical CompactSize encoding")]
    NonCanonicalVarInt,

    #[error("size {0} exceeds the maximum")]
    SizeTooLarge(u64),

    #[error("unknown transaction optional data")]
    UnknownOptionalData,

    #[error("superfluous witness record")]
    SuperfluousWitness,

    #[error("{0} trailing bytes after the encoded object")]
    TrailingBytes(usize),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

impl From<ParseError> for ConsensusError {
    fn from(err: ParseError) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

/// Objects with a consensus binary encoding
pub trait Encodable {
    fn encode(&self, out: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Objects that can be read back from their consensus encoding
pub trait Decodable: Sized {
    fn decode(reader: &mut Reader<'_>) -> Result<Self>;

    /// Decode from a buffer that must contain exactly one object
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let value = Self::decode(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(ParseError::TrailingBytes(reader.remaining()).into());
        }
        Ok(value)
    }
}

/// Cursor over a byte slice
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ParseError::InsufficientBytes {
                needed: len - self.remaining(),
            }
            .into());
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash> {
        self.read_array()
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        varint::read_varint(self)
    }

    /// Length-prefixed byte string
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = varint::read_length(self)?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    /// Count prefix for a vector whose elements take at least `min_element_size` bytes
    pub fn read_count(&mut self, min_element_size: usize) -> Result<usize> {
        let count = varint::read_length(self)?;
        if count.saturating_mul(min_element_size) > self.remaining() {
            return Err(ParseError::InsufficientBytes {
                needed: count * min_element_size - self.remaining(),
            }
            .into());
        }
        Ok(count)
    }
}

pub(crate) fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    varint::write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}
