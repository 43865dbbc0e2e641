//! Block and header wire format

use std::sync::Arc;

use super::varint::write_varint;
use super::{Decodable, Encodable, Reader};
use crate::constants::BLOCK_HEADER_SIZE;
use crate::error::Result;
use crate::hashes::sha256d;
use crate::types::*;

/// Smallest transaction encoding, used to bound the count prefix
const MIN_TRANSACTION_SIZE: usize = 10;

impl Encodable for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.prev_block_hash.0);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }
}

impl Decodable for BlockHeader {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(BlockHeader {
            version: reader.read_i32()?,
            prev_block_hash: BlockHash(reader.read_hash()?),
            merkle_root: reader.read_hash()?,
            timestamp: reader.read_u32()?,
            bits: reader.read_u32()?,
            nonce: reader.read_u32()?,
        })
    }
}

impl Encodable for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        write_varint(out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(out);
        }
    }
}

impl Decodable for Block {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let header = BlockHeader::decode(reader)?;
        let count = reader.read_count(MIN_TRANSACTION_SIZE)?;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Arc::new(Transaction::decode(reader)?));
        }
        Ok(Block {
            header,
            transactions,
        })
    }
}

pub fn serialize_block_header(header: &BlockHeader) -> [u8; BLOCK_HEADER_SIZE] {
    let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE);
    header.encode(&mut out);
    let mut fixed = [0u8; BLOCK_HEADER_SIZE];
    fixed.copy_from_slice(&out);
    fixed
}

pub fn deserialize_block_header(data: &[u8]) -> Result<BlockHeader> {
    BlockHeader::from_bytes(data)
}

pub fn compute_block_hash(header: &BlockHeader) -> BlockHash {
    BlockHash(sha256d(&serialize_block_header(header)))
}

/// Serialized size without witness data
pub fn block_base_size(block: &Block) -> usize {
    let mut size = BLOCK_HEADER_SIZE + super::varint::varint_size(block.transactions.len() as u64);
    for tx in &block.transactions {
        size += super::transaction::base_size(tx);
    }
    size
}

/// Serialized size including witness data
pub fn block_total_size(block: &Block) -> usize {
    block.to_bytes().len()
}
