//! Transaction wire format (BIP144 extended serialization for witnesses)

use super::varint::write_varint;
use super::{write_var_bytes, Decodable, Encodable, ParseError, Reader};
use crate::error::Result;
use crate::hashes::sha256d;
use crate::types::*;

/// Smallest possible encodings, used to bound counts before allocating
const MIN_INPUT_SIZE: usize = 41;
const MIN_OUTPUT_SIZE: usize = 9;

impl Encodable for OutPoint {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.txid.0);
        out.extend_from_slice(&self.index.to_le_bytes());
    }
}

impl Decodable for OutPoint {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(OutPoint {
            txid: Txid(reader.read_hash()?),
            index: reader.read_u32()?,
        })
    }
}

impl Encodable for TransactionOutput {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_le_bytes());
        write_var_bytes(out, &self.script_pubkey);
    }
}

impl Decodable for TransactionOutput {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(TransactionOutput {
            value: reader.read_i64()?,
            script_pubkey: reader.read_var_bytes()?,
        })
    }
}

fn encode_input(input: &TransactionInput, out: &mut Vec<u8>) {
    input.prevout.encode(out);
    write_var_bytes(out, &input.script_sig);
    out.extend_from_slice(&input.sequence.to_le_bytes());
}

fn decode_input(reader: &mut Reader<'_>) -> Result<TransactionInput> {
    Ok(TransactionInput {
        prevout: OutPoint::decode(reader)?,
        script_sig: reader.read_var_bytes()?,
        sequence: reader.read_u32()?,
        witness: Vec::new(),
    })
}

pub(crate) fn encode_witness(witness: &Witness, out: &mut Vec<u8>) {
    write_varint(out, witness.len() as u64);
    for item in witness {
        write_var_bytes(out, item);
    }
}

pub(crate) fn decode_witness(reader: &mut Reader<'_>) -> Result<Witness> {
    let count = reader.read_count(1)?;
    let mut witness = Vec::with_capacity(count);
    for _ in 0..count {
        witness.push(reader.read_var_bytes()?);
    }
    Ok(witness)
}

/// Encode a transaction, optionally including witness data
pub fn encode_transaction(tx: &Transaction, include_witness: bool, out: &mut Vec<u8>) {
    let extended = include_witness && tx.has_witness();
    out.extend_from_slice(&tx.version.to_le_bytes());
    if extended {
        out.push(0x00);
        out.push(0x01);
    }
    write_varint(out, tx.inputs.len() as u64);
    for input in &tx.inputs {
        encode_input(input, out);
    }
    write_varint(out, tx.outputs.len() as u64);
    for output in &tx.outputs {
        output.encode(out);
    }
    if extended {
        for input in &tx.inputs {
            encode_witness(&input.witness, out);
        }
    }
    out.extend_from_slice(&tx.lock_time.to_le_bytes());
}

impl Encodable for Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_transaction(self, true, out);
    }
}

impl Decodable for Transaction {
    /// A zero input count is read as the segwit marker; the flag byte that
    /// follows selects the extended format.
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let version = reader.read_i32()?;
        let mut flags = 0u8;
        let mut inputs = read_inputs(reader)?;
        let outputs;
        if inputs.is_empty() {
            flags = reader.read_u8()?;
            if flags != 0 {
                inputs = read_inputs(reader)?;
                outputs = read_outputs(reader)?;
            } else {
                outputs = Vec::new();
            }
        } else {
            outputs = read_outputs(reader)?;
        }
        if flags & 1 != 0 {
            flags ^= 1;
            for input in inputs.iter_mut() {
                input.witness = decode_witness(reader)?;
            }
            if !inputs.iter().any(|input| !input.witness.is_empty()) {
                return Err(ParseError::SuperfluousWitness.into());
            }
        }
        if flags != 0 {
            return Err(ParseError::UnknownOptionalData.into());
        }
        let lock_time = reader.read_u32()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

fn read_inputs(reader: &mut Reader<'_>) -> Result<Vec<TransactionInput>> {
    let count = reader.read_count(MIN_INPUT_SIZE)?;
    let mut inputs = Vec::with_capacity(count);
    for _ in 0..count {
        inputs.push(decode_input(reader)?);
    }
    Ok(inputs)
}

fn read_outputs(reader: &mut Reader<'_>) -> Result<Vec<TransactionOutput>> {
    let count = reader.read_count(MIN_OUTPUT_SIZE)?;
    let mut outputs = Vec::with_capacity(count);
    for _ in 0..count {
        outputs.push(TransactionOutput::decode(reader)?);
    }
    Ok(outputs)
}

/// Serialize with witness data when present
pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    tx.to_bytes()
}

/// Serialize without witness data (the txid preimage)
pub fn serialize_transaction_no_witness(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::new();
    encode_transaction(tx, false, &mut out);
    out
}

pub fn deserialize_transaction(data: &[u8]) -> Result<Transaction> {
    Transaction::from_bytes(data)
}

pub fn compute_txid(tx: &Transaction) -> Txid {
    Txid(sha256d(&serialize_transaction_no_witness(tx)))
}

pub fn compute_wtxid(tx: &Transaction) -> Wtxid {
    Wtxid(sha256d(&serialize_transaction(tx)))
}

/// Base size: serialized size without witness
pub fn base_size(tx: &Transaction) -> usize {
    serialize_transaction_no_witness(tx).len()
}

/// Total size: serialized size including witness
pub fn total_size(tx: &Transaction) -> usize {
    serialize_transaction(tx).len()
}
