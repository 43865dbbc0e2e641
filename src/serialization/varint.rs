//! CompactSize integer encoding
//!
//! - value < 0xfd: single byte
//! - value <= 0xffff: 0xfd prefix + 2 bytes (little-endian)
//! - value <= 0xffffffff: 0xfe prefix + 4 bytes (little-endian)
//! - otherwise: 0xff prefix + 8 bytes (little-endian)
//!
//! Decoding rejects non-canonical encodings.

use super::{ParseError, Reader};
use crate::error::Result;

/// Largest length prefix accepted when decoding
pub const MAX_SIZE: u64 = 0x0200_0000;

/// Encode a u64 value as a CompactSize
///
/// ```
/// use aureus_kernel::serialization::varint::encode_varint;
///
/// assert_eq!(encode_varint(252), vec![252]);
/// assert_eq!(encode_varint(253), vec![0xfd, 253, 0]);
/// assert_eq!(encode_varint(65536), vec![0xfe, 0, 0, 1, 0]);
/// ```
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    write_varint(&mut out, value);
    out
}

pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Number of bytes `write_varint` emits for `value`
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Decode a CompactSize, returning the value and the number of bytes consumed
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut reader = Reader::new(data);
    let value = read_varint(&mut reader)?;
    Ok((value, reader.position()))
}

pub(crate) fn read_varint(reader: &mut Reader<'_>) -> Result<u64> {
    let prefix = reader.read_u8()?;
    let value = match prefix {
        0xfd => {
            let v = reader.read_u16()? as u64;
            if v < 0xfd {
                return Err(ParseError::NonCanonicalVarInt.into());
            }
            v
        }
        0xfe => {
            let v = reader.read_u32()? as u64;
            if v <= 0xffff {
                return Err(ParseError::NonCanonicalVarInt.into());
            }
            v
        }
        0xff => {
            let v = reader.read_u64()?;
            if v <= 0xffff_ffff {
                return Err(ParseError::NonCanonicalVarInt.into());
            }
            v
        }
        small => small as u64,
    };
    Ok(value)
}

/// CompactSize used as a length or count; bounded by [`MAX_SIZE`]
pub(crate) fn read_length(reader: &mut Reader<'_>) -> Result<usize> {
    let value = read_varint(reader)?;
    if value > MAX_SIZE {
        return Err(ParseError::SizeTooLarge(value).into());
    }
    Ok(value as usize)
}
