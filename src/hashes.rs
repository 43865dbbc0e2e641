//! Hash primitives used by consensus
//!
//! SHA256, SHA256d, RIPEMD160, HASH160, SHA1, BIP340 tagged hashes and the
//! transaction merkle tree.

use bitcoin_hashes::{sha1, Hash as BitcoinHash};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::types::*;

/// SHA256(x)
pub fn sha256(data: &[u8]) -> Hash {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// SHA256(SHA256(x))
pub fn sha256d(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(first));
    out
}

/// RIPEMD160(x)
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(data));
    out
}

/// RIPEMD160(SHA256(x))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(&Sha256::digest(data))
}

/// SHA1(x), only reachable through OP_SHA1
pub fn sha1(data: &[u8]) -> [u8; 20] {
    sha1::Hash::hash(data).into_inner()
}

/// Engine pre-loaded with SHA256(tag) || SHA256(tag) (BIP340)
pub fn tagged_engine(tag: &str) -> Sha256 {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut engine = Sha256::new();
    engine.update(tag_hash);
    engine.update(tag_hash);
    engine
}

/// hash_tag(x) = SHA256(SHA256(tag) || SHA256(tag) || x)
pub fn tagged_hash(tag: &str, data: &[u8]) -> Hash {
    let mut engine = tagged_engine(tag);
    engine.update(data);
    finalize(engine)
}

/// Finish a SHA256 engine into a fixed array
pub fn finalize(engine: Sha256) -> Hash {
    let mut out = [0u8; 32];
    out.copy_from_slice(&engine.finalize());
    out
}

/// ComputeMerkleRoot: ℍ* → ℍ × 𝔹
///
/// Returns the root and whether the tree is mutated, i.e. two identical
/// siblings were hashed together somewhere (CVE-2012-2459). A mutated tree
/// has the same root as a different transaction list.
pub fn merkle_root(mut hashes: Vec<Hash>) -> (Hash, bool) {
    if hashes.is_empty() {
        return ([0u8; 32], false);
    }
    let mut mutated = false;
    while hashes.len() > 1 {
        for pair in hashes.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if hashes.len() % 2 == 1 {
            if let Some(last) = hashes.last().copied() {
                hashes.push(last);
            }
        }
        hashes = hashes
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                sha256d(&buf)
            })
            .collect();
    }
    (hashes[0], mutated)
}

/// Merkle root over the txids of a block
pub fn block_merkle_root(block: &Block) -> (Hash, bool) {
    merkle_root(block.transactions.iter().map(|tx| tx.txid().0).collect())
}

/// Merkle root over the wtxids of a block, the coinbase counting as zero
pub fn block_witness_merkle_root(block: &Block) -> Hash {
    let leaves = block
        .transactions
        .iter()
        .enumerate()
        .map(|(i, tx)| if i == 0 { [0u8; 32] } else { tx.wtxid().0 })
        .collect();
    merkle_root(leaves).0
}
