//! Storage encodings for coins and block undo data
//!
//! Coins are stored as `varint(height * 2 + is_coinbase)` followed by the
//! output, undo data as nested counted vectors of coins.

use super::varint::write_varint;
use super::{Decodable, Encodable, ParseError, Reader};
use crate::error::Result;
use crate::types::*;

impl Encodable for Coin {
    fn encode(&self, out: &mut Vec<u8>) {
        let code = (self.height as u64) * 2 + self.is_coinbase as u64;
        write_varint(out, code);
        self.output.encode(out);
    }
}

impl Decodable for Coin {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let code = reader.read_varint()?;
        let height = u32::try_from(code >> 1).map_err(|_| ParseError::InvalidField("coin height"))?;
        Ok(Coin {
            height,
            is_coinbase: code & 1 == 1,
            output: TransactionOutput::decode(reader)?,
        })
    }
}

impl Encodable for TransactionSpentOutputs {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(out, self.coins.len() as u64);
        for coin in &self.coins {
            coin.encode(out);
        }
    }
}

impl Decodable for TransactionSpentOutputs {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let count = reader.read_count(10)?;
        let mut coins = Vec::with_capacity(count);
        for _ in 0..count {
            coins.push(Coin::decode(reader)?);
        }
        Ok(TransactionSpentOutputs { coins })
    }
}

impl Encodable for BlockSpentOutputs {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(out);
        }
    }
}

impl Decodable for BlockSpentOutputs {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let count = reader.read_count(1)?;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(TransactionSpentOutputs::decode(reader)?);
        }
        Ok(BlockSpentOutputs { transactions })
    }
}
