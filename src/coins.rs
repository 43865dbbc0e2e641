//! UTXO set views
//!
//! Reads fall through a stack of layers: a per-block scratch cache, the
//! long-lived chainstate cache and finally the database. Writes only ever land
//! in the topmost layer and move down on an explicit flush, so a block that
//! fails halfway leaves nothing behind once its scratch layer is dropped.

use std::collections::{HashMap, HashSet};
use std::mem::size_of;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ConsensusError, Result};
use crate::script::is_unspendable;
use crate::serialization::varint::{decode_varint, write_varint};
use crate::serialization::{Decodable, Encodable};
use crate::storage::{KeyValueStore, WriteBatch};
use crate::types::*;

const COIN_PREFIX: u8 = b'C';
const BEST_BLOCK_KEY: &[u8] = b"B";

/// Read access to a set of unspent coins
pub trait CoinsView {
    /// GetCoin: 𝒪 → 𝒞 ∪ {⊥}
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    /// Block up to which this view reflects the chain
    fn best_block(&self) -> Result<Option<BlockHash>>;
}

/// Layer that can absorb the changes of the layer above it
pub trait CoinsSink {
    fn batch_write(&mut self, entries: HashMap<OutPoint, CacheEntry>, best_block: Option<BlockHash>) -> Result<()>;
}

impl<T: CoinsView + ?Sized> CoinsView for &T {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        (**self).get_coin(outpoint)
    }

    fn best_block(&self) -> Result<Option<BlockHash>> {
        (**self).best_block()
    }
}

impl<T: CoinsView + ?Sized> CoinsView for &mut T {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        (**self).get_coin(outpoint)
    }

    fn best_block(&self) -> Result<Option<BlockHash>> {
        (**self).best_block()
    }
}

impl<T: CoinsSink + ?Sized> CoinsSink for &mut T {
    fn batch_write(&mut self, entries: HashMap<OutPoint, CacheEntry>, best_block: Option<BlockHash>) -> Result<()> {
        (**self).batch_write(entries, best_block)
    }
}

fn coin_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32 + 5);
    key.push(COIN_PREFIX);
    key.extend_from_slice(outpoint.txid.as_bytes());
    write_varint(&mut key, outpoint.index as u64);
    key
}

fn outpoint_from_key(key: &[u8]) -> Option<OutPoint> {
    if key.len() < 34 || key[0] != COIN_PREFIX {
        return None;
    }
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&key[1..33]);
    let (index, _) = decode_varint(&key[33..]).ok()?;
    Some(OutPoint::new(Txid(txid), u32::try_from(index).ok()?))
}

/// Coins database over a key-value store
#[derive(Clone)]
pub struct CoinsViewDb {
    store: Arc<dyn KeyValueStore>,
}

impl CoinsViewDb {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        CoinsViewDb { store }
    }

    /// Every coin in the database, in key order
    pub fn all_coins(&self) -> Result<Vec<(OutPoint, Coin)>> {
        let mut coins = Vec::new();
        for (key, value) in self.store.scan_prefix(&[COIN_PREFIX])? {
            let outpoint = outpoint_from_key(&key)
                .ok_or_else(|| ConsensusError::Storage("malformed coin key".to_string()))?;
            coins.push((outpoint, Coin::from_bytes(&value)?));
        }
        Ok(coins)
    }
}

impl CoinsView for CoinsViewDb {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        match self.store.get(&coin_key(outpoint))? {
            Some(bytes) => Ok(Some(Coin::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Option<BlockHash>> {
        match self.store.get(BEST_BLOCK_KEY)? {
            Some(bytes) if bytes.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(BlockHash(hash)))
            }
            Some(_) => Err(ConsensusError::Storage("malformed best block record".to_string())),
            None => Ok(None),
        }
    }
}

impl CoinsSink for CoinsViewDb {
    fn batch_write(&mut self, entries: HashMap<OutPoint, CacheEntry>, best_block: Option<BlockHash>) -> Result<()> {
        let mut batch = WriteBatch::new();
        let mut written = 0usize;
        let mut erased = 0usize;
        for (outpoint, entry) in entries {
            if !entry.dirty {
                continue;
            }
            match entry.coin {
                Some(coin) => {
                    batch.put(coin_key(&outpoint), coin.to_bytes());
                    written += 1;
                }
                None => {
                    batch.delete(coin_key(&outpoint));
                    erased += 1;
                }
            }
        }
        if let Some(hash) = best_block {
            batch.put(BEST_BLOCK_KEY, hash.as_bytes().to_vec());
        }
        debug!("writing {} coins and erasing {} to the coins database", written, erased);
        self.store.write_batch(batch)
    }
}

/// One cached outpoint; `coin` is `None` once spent
///
/// `dirty` entries differ from the layer below. `fresh` entries do not exist
/// in the layer below, so spending them can simply forget them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub coin: Option<Coin>,
    pub dirty: bool,
    pub fresh: bool,
}

/// In-memory overlay over another view
pub struct CoinsViewCache<B> {
    base: B,
    entries: HashMap<OutPoint, CacheEntry>,
    best_block: Option<BlockHash>,
    memory_usage: usize,
}

fn entry_usage(entry: &CacheEntry) -> usize {
    size_of::<OutPoint>()
        + size_of::<CacheEntry>()
        + entry.coin.as_ref().map(|c| c.output.script_pubkey.len()).unwrap_or(0)
}

impl<B: CoinsView> CoinsViewCache<B> {
    pub fn new(base: B) -> Self {
        CoinsViewCache {
            base,
            entries: HashMap::new(),
            best_block: None,
            memory_usage: 0,
        }
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn set_best_block(&mut self, hash: BlockHash) {
        self.best_block = Some(hash);
    }

    /// Number of outpoints held in this layer
    pub fn cache_size(&self) -> usize {
        self.entries.len()
    }

    /// Approximate heap footprint of this layer in bytes
    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    fn insert_entry(&mut self, outpoint: OutPoint, entry: CacheEntry) {
        self.memory_usage += entry_usage(&entry);
        if let Some(old) = self.entries.insert(outpoint, entry) {
            self.memory_usage -= entry_usage(&old);
        }
    }

    fn remove_entry(&mut self, outpoint: &OutPoint) {
        if let Some(old) = self.entries.remove(outpoint) {
            self.memory_usage -= entry_usage(&old);
        }
    }

    /// Add a new coin
    ///
    /// Provably unspendable outputs are never stored. Unless
    /// `possible_overwrite` is set, replacing an unspent coin is an error.
    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin, possible_overwrite: bool) -> Result<()> {
        if is_unspendable(&coin.output.script_pubkey) {
            return Ok(());
        }
        let mut fresh = false;
        if !possible_overwrite {
            match self.entries.get(&outpoint) {
                Some(existing) if existing.coin.is_some() => {
                    return Err(ConsensusError::ConsensusRuleViolation(format!(
                        "attempted to overwrite unspent coin {}:{}",
                        outpoint.txid, outpoint.index
                    )));
                }
                Some(existing) => fresh = !existing.dirty,
                None => fresh = true,
            }
        }
        let fresh = fresh || self.entries.get(&outpoint).map(|e| e.fresh).unwrap_or(false);
        self.insert_entry(
            outpoint,
            CacheEntry {
                coin: Some(coin),
                dirty: true,
                fresh,
            },
        );
        Ok(())
    }

    /// Spend a coin, returning it; `None` when it does not exist
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        let (coin, fresh) = match self.entries.get(outpoint) {
            Some(entry) => match &entry.coin {
                Some(coin) => (coin.clone(), entry.fresh),
                None => return Ok(None),
            },
            None => match self.base.get_coin(outpoint)? {
                Some(coin) => (coin, false),
                None => return Ok(None),
            },
        };
        if fresh {
            self.remove_entry(outpoint);
        } else {
            self.insert_entry(
                *outpoint,
                CacheEntry {
                    coin: None,
                    dirty: true,
                    fresh: false,
                },
            );
        }
        Ok(Some(coin))
    }

    /// ApplyBlock: spend every outpoint of `spends`, then add `creates`
    ///
    /// Either all spends exist and everything is applied, or nothing changes.
    /// Spent coins come back in the order of `spends`. Created coins may
    /// replace unspent ones; ruling that out (BIP30) is up to the caller.
    pub fn apply_block(&mut self, spends: &[OutPoint], creates: Vec<(OutPoint, Coin)>) -> Result<Vec<Coin>> {
        let mut seen = HashSet::with_capacity(spends.len());
        for outpoint in spends {
            if !seen.insert(*outpoint) || !self.have_coin(outpoint)? {
                return Err(ConsensusError::ConsensusRuleViolation(format!(
                    "missing or duplicate spend of {}:{}",
                    outpoint.txid, outpoint.index
                )));
            }
        }
        let mut spent = Vec::with_capacity(spends.len());
        for outpoint in spends {
            if let Some(coin) = self.spend_coin(outpoint)? {
                spent.push(coin);
            }
        }
        for (outpoint, coin) in creates {
            let overwrite = coin.is_coinbase || self.have_coin(&outpoint)?;
            self.add_coin(outpoint, coin, overwrite)?;
        }
        Ok(spent)
    }

    /// Apply one transaction at `height`, returning the coins its inputs spent
    pub fn apply_transaction(&mut self, tx: &Transaction, height: u32) -> Result<Vec<Coin>> {
        let spends: Vec<OutPoint> = if tx.is_coinbase() {
            Vec::new()
        } else {
            tx.inputs.iter().map(|input| input.prevout).collect()
        };
        let txid = tx.txid();
        let coinbase = tx.is_coinbase();
        let creates = tx
            .outputs
            .iter()
            .enumerate()
            .map(|(index, output)| (OutPoint::new(txid, index as u32), Coin::new(output.clone(), height, coinbase)))
            .collect();
        self.apply_block(&spends, creates)
    }
}

impl<B: CoinsView + CoinsSink> CoinsViewCache<B> {
    /// Push every change of this layer into the base and empty the layer
    ///
    /// On failure the layer is left untouched so the flush can be retried.
    pub fn flush(&mut self) -> Result<()> {
        let count = self.entries.len();
        self.base.batch_write(self.entries.clone(), self.best_block)?;
        self.entries.clear();
        self.memory_usage = 0;
        debug!("flushed {} cached coins", count);
        Ok(())
    }
}

impl<B: CoinsView> CoinsView for CoinsViewCache<B> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok(entry.coin.clone()),
            None => self.base.get_coin(outpoint),
        }
    }

    fn best_block(&self) -> Result<Option<BlockHash>> {
        match self.best_block {
            Some(hash) => Ok(Some(hash)),
            None => self.base.best_block(),
        }
    }
}

impl<B: CoinsView> CoinsSink for CoinsViewCache<B> {
    fn batch_write(&mut self, entries: HashMap<OutPoint, CacheEntry>, best_block: Option<BlockHash>) -> Result<()> {
        for (outpoint, child) in entries {
            if !child.dirty {
                continue;
            }
            let parent = self.entries.get(&outpoint).cloned();
            match parent {
                None => {
                    // created and spent above us: nothing to record
                    if child.fresh && child.coin.is_none() {
                        continue;
                    }
                    self.insert_entry(
                        outpoint,
                        CacheEntry {
                            coin: child.coin,
                            dirty: true,
                            fresh: child.fresh,
                        },
                    );
                }
                Some(parent) => {
                    if child.fresh && parent.coin.is_some() {
                        return Err(ConsensusError::Fatal(format!(
                            "fresh coin {}:{} already unspent in parent cache",
                            outpoint.txid, outpoint.index
                        )));
                    }
                    if parent.fresh && child.coin.is_none() {
                        self.remove_entry(&outpoint);
                    } else {
                        self.insert_entry(
                            outpoint,
                            CacheEntry {
                                coin: child.coin,
                                dirty: true,
                                fresh: parent.fresh,
                            },
                        );
                    }
                }
            }
        }
        if best_block.is_some() {
            self.best_block = best_block;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;

    fn coin(value: i64, height: u32) -> Coin {
        Coin::new(
            TransactionOutput {
                value,
                script_pubkey: vec![0x51],
            },
            height,
            false,
        )
    }

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([n; 32]), n as u32)
    }

    fn db() -> CoinsViewDb {
        CoinsViewDb::new(Arc::new(MemoryKeyValueStore::new()))
    }

    #[test]
    fn test_key_round_trip() {
        let op = OutPoint::new(Txid::from_byte_array([7; 32]), 70_000);
        assert_eq!(outpoint_from_key(&coin_key(&op)), Some(op));
    }

    #[test]
    fn test_read_through_and_flush() {
        let mut cache = CoinsViewCache::new(db());
        cache.add_coin(outpoint(1), coin(10, 1), false).unwrap();
        cache.set_best_block(BlockHash::from_byte_array([9; 32]));
        assert_eq!(cache.get_coin(&outpoint(1)).unwrap(), Some(coin(10, 1)));
        assert_eq!(cache.base().get_coin(&outpoint(1)).unwrap(), None);

        cache.flush().unwrap();
        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.base().get_coin(&outpoint(1)).unwrap(), Some(coin(10, 1)));
        assert_eq!(
            cache.base().best_block().unwrap(),
            Some(BlockHash::from_byte_array([9; 32]))
        );
    }

    #[test]
    fn test_spend_fresh_coin_leaves_no_trace() {
        let mut cache = CoinsViewCache::new(db());
        cache.add_coin(outpoint(1), coin(10, 1), false).unwrap();
        assert_eq!(cache.spend_coin(&outpoint(1)).unwrap(), Some(coin(10, 1)));
        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.spend_coin(&outpoint(1)).unwrap(), None);
    }

    #[test]
    fn test_spend_from_database() {
        let mut cache = CoinsViewCache::new(db());
        cache.add_coin(outpoint(2), coin(20, 1), false).unwrap();
        cache.flush().unwrap();

        assert_eq!(cache.spend_coin(&outpoint(2)).unwrap(), Some(coin(20, 1)));
        assert!(!cache.have_coin(&outpoint(2)).unwrap());
        assert!(cache.base().have_coin(&outpoint(2)).unwrap());
        cache.flush().unwrap();
        assert!(!cache.base().have_coin(&outpoint(2)).unwrap());
        assert!(cache.base().all_coins().unwrap().is_empty());
    }

    #[test]
    fn test_overwrite_unspent_rejected() {
        let mut cache = CoinsViewCache::new(db());
        cache.add_coin(outpoint(1), coin(10, 1), false).unwrap();
        assert!(cache.add_coin(outpoint(1), coin(11, 2), false).is_err());
        cache.add_coin(outpoint(1), coin(11, 2), true).unwrap();
        assert_eq!(cache.get_coin(&outpoint(1)).unwrap(), Some(coin(11, 2)));
    }

    #[test]
    fn test_unspendable_outputs_skipped() {
        let mut cache = CoinsViewCache::new(db());
        let mut c = coin(0, 1);
        c.output.script_pubkey = vec![0x6a, 0x01, 0x00];
        cache.add_coin(outpoint(3), c, false).unwrap();
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn test_child_layer_discarded_on_drop() {
        let mut parent = CoinsViewCache::new(db());
        parent.add_coin(outpoint(1), coin(10, 1), false).unwrap();
        {
            let mut child = CoinsViewCache::new(&mut parent);
            child.spend_coin(&outpoint(1)).unwrap();
            child.add_coin(outpoint(2), coin(5, 2), false).unwrap();
        }
        assert!(parent.have_coin(&outpoint(1)).unwrap());
        assert!(!parent.have_coin(&outpoint(2)).unwrap());
    }

    #[test]
    fn test_child_layer_flush_into_parent() {
        let mut parent = CoinsViewCache::new(db());
        parent.add_coin(outpoint(1), coin(10, 1), false).unwrap();
        parent.flush().unwrap();
        parent.add_coin(outpoint(4), coin(40, 1), false).unwrap();
        {
            let mut child = CoinsViewCache::new(&mut parent);
            child.spend_coin(&outpoint(1)).unwrap();
            child.spend_coin(&outpoint(4)).unwrap();
            child.add_coin(outpoint(2), coin(5, 2), false).unwrap();
            child.set_best_block(BlockHash::from_byte_array([2; 32]));
            child.flush().unwrap();
        }
        assert!(!parent.have_coin(&outpoint(1)).unwrap());
        assert!(parent.have_coin(&outpoint(2)).unwrap());
        // fresh in the parent and spent in the child: forgotten entirely
        assert_eq!(parent.cache_size(), 2);
        parent.flush().unwrap();
        let coins = parent.base().all_coins().unwrap();
        assert_eq!(coins, vec![(outpoint(2), coin(5, 2))]);
    }

    #[test]
    fn test_apply_block_all_or_nothing() {
        let mut cache = CoinsViewCache::new(db());
        cache.add_coin(outpoint(1), coin(10, 1), false).unwrap();
        let err = cache.apply_block(&[outpoint(1), outpoint(9)], vec![(outpoint(2), coin(1, 2))]);
        assert!(err.is_err());
        assert!(cache.have_coin(&outpoint(1)).unwrap());
        assert!(!cache.have_coin(&outpoint(2)).unwrap());

        assert!(cache.apply_block(&[outpoint(1), outpoint(1)], vec![]).is_err());

        let spent = cache
            .apply_block(&[outpoint(1)], vec![(outpoint(2), coin(1, 2))])
            .unwrap();
        assert_eq!(spent, vec![coin(10, 1)]);
        assert!(cache.have_coin(&outpoint(2)).unwrap());
    }

    #[test]
    fn test_apply_transaction_returns_spent_in_input_order() {
        let mut cache = CoinsViewCache::new(db());
        cache.add_coin(outpoint(1), coin(10, 1), false).unwrap();
        cache.add_coin(outpoint(2), coin(20, 1), false).unwrap();
        let input = |n: u8| TransactionInput {
            prevout: outpoint(n),
            script_sig: vec![],
            sequence: 0xffff_ffff,
            witness: vec![],
        };
        let tx = Transaction {
            version: 2,
            inputs: vec![input(2), input(1)],
            outputs: vec![TransactionOutput {
                value: 25,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };

        let spent = cache.apply_transaction(&tx, 5).unwrap();
        assert_eq!(spent, vec![coin(20, 1), coin(10, 1)]);
        assert!(!cache.have_coin(&outpoint(1)).unwrap());
        let created = cache.get_coin(&OutPoint::new(tx.txid(), 0)).unwrap().unwrap();
        assert_eq!(created.height, 5);
        assert!(!created.is_coinbase);

        // inputs already spent: nothing changes
        assert!(cache.apply_transaction(&tx, 6).is_err());
        assert_eq!(cache.get_coin(&OutPoint::new(tx.txid(), 0)).unwrap().unwrap().height, 5);
    }

    #[test]
    fn test_memory_usage_tracks_entries() {
        let mut cache = CoinsViewCache::new(db());
        assert_eq!(cache.memory_usage(), 0);
        cache.add_coin(outpoint(1), coin(10, 1), false).unwrap();
        let one = cache.memory_usage();
        assert!(one > 0);
        cache.spend_coin(&outpoint(1)).unwrap();
        assert_eq!(cache.memory_usage(), 0);
    }
}
