//! Persistence collaborators
//!
//! The engine talks to storage through two traits. [`KeyValueStore`] holds the
//! block index and the coins database; [`BlockStore`] holds raw blocks and
//! their undo data. Both come with an in-memory implementation for tests and
//! ephemeral nodes. On disk, key-value data lives in redb databases and blocks
//! in flat files.
//!
//! Block files follow the node's flat-file layout: `blkNNNNN.dat` and
//! `revNNNNN.dat`, each record framed by the network magic and a 4-byte
//! little-endian length. Undo records additionally carry a double-SHA256
//! checksum over the parent block hash and the record.

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::constants::MAX_BLOCK_SERIALIZED_SIZE;
use crate::error::{ConsensusError, Result};
use crate::hashes::sha256d;
use crate::serialization::varint::MAX_SIZE;
use crate::serialization::{Decodable, Encodable};
use crate::types::*;

/// Location of a record inside the block files: `offset` points past the framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    pub file: u32,
    pub offset: u64,
}

// ============================================================================
// KEY-VALUE STORE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Writes applied together or not at all
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn apply_to(&self, map: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        for op in &self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key.clone(), value.clone());
                }
                BatchOp::Delete(key) => {
                    map.remove(key);
                }
            }
        }
    }
}

/// Ordered byte-string key-value store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply all writes of `batch` atomically
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    /// All pairs whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write_batch(batch)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write_batch(batch)
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.scan_prefix(&[])?.is_empty())
    }
}

fn prefix_range(map: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.range(prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Key-value store that lives and dies with the process
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        MemoryKeyValueStore::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        batch.apply_to(&mut self.map.write());
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(prefix_range(&self.map.read(), prefix))
    }
}

/// Key-value store backed by a single redb table
///
/// Every batch is one write transaction; redb commits are durable before
/// `write_batch` returns.
pub struct RedbKeyValueStore {
    db: Database,
    table: TableDefinition<'static, &'static [u8], &'static [u8]>,
}

fn redb_error(err: impl Into<redb::Error>) -> ConsensusError {
    let err: redb::Error = err.into();
    ConsensusError::Storage(err.to_string())
}

impl RedbKeyValueStore {
    /// Open or create the database at `path`, holding its keys in `table`
    pub fn open(path: &Path, table: &'static str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(redb_error)?;
        let table = TableDefinition::new(table);
        let txn = db.begin_write().map_err(redb_error)?;
        txn.open_table(table).map_err(redb_error)?;
        txn.commit().map_err(redb_error)?;
        debug!("opened key-value database {}", path.display());
        Ok(RedbKeyValueStore { db, table })
    }
}

impl KeyValueStore for RedbKeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(redb_error)?;
        let table = txn.open_table(self.table).map_err(redb_error)?;
        let value = table.get(key).map_err(redb_error)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(redb_error)?;
        {
            let mut table = txn.open_table(self.table).map_err(redb_error)?;
            for op in &batch.ops {
                match op {
                    BatchOp::Put(key, value) => {
                        table.insert(key.as_slice(), value.as_slice()).map_err(redb_error)?;
                    }
                    BatchOp::Delete(key) => {
                        table.remove(key.as_slice()).map_err(redb_error)?;
                    }
                }
            }
        }
        txn.commit().map_err(redb_error)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(redb_error)?;
        let table = txn.open_table(self.table).map_err(redb_error)?;
        let mut found = Vec::new();
        for entry in table.range::<&[u8]>(prefix..).map_err(redb_error)? {
            let (key, value) = entry.map_err(redb_error)?;
            if !key.value().starts_with(prefix) {
                break;
            }
            found.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(found)
    }
}

// ============================================================================
// BLOCK STORE
// ============================================================================

/// Append-only storage of blocks and undo data, addressed by position
pub trait BlockStore: Send + Sync {
    fn write_block(&self, block: &Block) -> Result<BlockPos>;

    fn read_block(&self, pos: BlockPos) -> Result<Block>;

    /// Store the undo data of the block stored at `block_pos`
    fn write_undo(&self, block_pos: BlockPos, prev_hash: &BlockHash, undo: &BlockSpentOutputs) -> Result<BlockPos>;

    /// Read undo data, checking it belongs to a block whose parent is `prev_hash`
    fn read_undo(&self, pos: BlockPos, prev_hash: &BlockHash) -> Result<BlockSpentOutputs>;

    /// Positions of every stored block in write order
    fn block_positions(&self) -> Result<Vec<BlockPos>>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn undo_checksum(prev_hash: &BlockHash, undo_bytes: &[u8]) -> Hash {
    let mut data = Vec::with_capacity(32 + undo_bytes.len());
    data.extend_from_slice(prev_hash.as_bytes());
    data.extend_from_slice(undo_bytes);
    sha256d(&data)
}

fn decode_undo_record(record: &[u8], prev_hash: &BlockHash) -> Result<BlockSpentOutputs> {
    if record.len() < 32 {
        return Err(ConsensusError::Storage("undo record too short".to_string()));
    }
    let (body, checksum) = record.split_at(record.len() - 32);
    if undo_checksum(prev_hash, body)[..] != *checksum {
        return Err(ConsensusError::Storage("undo data checksum mismatch".to_string()));
    }
    BlockSpentOutputs::from_bytes(body)
}

fn encode_undo_record(prev_hash: &BlockHash, undo: &BlockSpentOutputs) -> Vec<u8> {
    let mut record = undo.to_bytes();
    let checksum = undo_checksum(prev_hash, &record);
    record.extend_from_slice(&checksum);
    record
}

/// Block store kept in memory; positions index into record vectors
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<Vec<Vec<u8>>>,
    undo: RwLock<Vec<Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        MemoryBlockStore::default()
    }
}

fn missing(kind: &str, pos: BlockPos) -> ConsensusError {
    ConsensusError::Storage(format!("no {} record at {}:{}", kind, pos.file, pos.offset))
}

impl BlockStore for MemoryBlockStore {
    fn write_block(&self, block: &Block) -> Result<BlockPos> {
        let mut blocks = self.blocks.write();
        blocks.push(block.to_bytes());
        Ok(BlockPos {
            file: 0,
            offset: blocks.len() as u64 - 1,
        })
    }

    fn read_block(&self, pos: BlockPos) -> Result<Block> {
        let blocks = self.blocks.read();
        let data = blocks.get(pos.offset as usize).ok_or_else(|| missing("block", pos))?;
        Block::from_bytes(data)
    }

    fn write_undo(&self, _block_pos: BlockPos, prev_hash: &BlockHash, undo: &BlockSpentOutputs) -> Result<BlockPos> {
        let mut records = self.undo.write();
        records.push(encode_undo_record(prev_hash, undo));
        Ok(BlockPos {
            file: 0,
            offset: records.len() as u64 - 1,
        })
    }

    fn read_undo(&self, pos: BlockPos, prev_hash: &BlockHash) -> Result<BlockSpentOutputs> {
        let records = self.undo.read();
        let record = records.get(pos.offset as usize).ok_or_else(|| missing("undo", pos))?;
        decode_undo_record(record, prev_hash)
    }

    fn block_positions(&self) -> Result<Vec<BlockPos>> {
        let count = self.blocks.read().len() as u64;
        Ok((0..count).map(|offset| BlockPos { file: 0, offset }).collect())
    }
}

/// Maximum size of one block file before a new one is started
pub const MAX_BLOCKFILE_SIZE: u64 = 0x0800_0000;

const FRAME_SIZE: u64 = 8;

#[derive(Debug)]
struct FlatFileState {
    current_file: u32,
    current_size: u64,
    /// Files written since the last flush
    unsynced: BTreeSet<(&'static str, u32)>,
}

/// Block store over `blkNNNNN.dat` / `revNNNNN.dat` files in one directory
#[derive(Debug)]
pub struct FlatFileBlockStore {
    dir: PathBuf,
    magic: [u8; 4],
    max_file_size: u64,
    state: Mutex<FlatFileState>,
}

fn file_name(prefix: &str, file: u32) -> String {
    format!("{}{:05}.dat", prefix, file)
}

impl FlatFileBlockStore {
    pub fn open(dir: &Path, magic: [u8; 4]) -> Result<Self> {
        Self::with_max_file_size(dir, magic, MAX_BLOCKFILE_SIZE)
    }

    pub fn with_max_file_size(dir: &Path, magic: [u8; 4], max_file_size: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut current_file = 0;
        while dir.join(file_name("blk", current_file + 1)).exists() {
            current_file += 1;
        }
        let current_path = dir.join(file_name("blk", current_file));
        let current_size = if current_path.exists() {
            fs::metadata(&current_path)?.len()
        } else {
            0
        };
        info!("block files in {} (last file {})", dir.display(), current_file);
        Ok(FlatFileBlockStore {
            dir: dir.to_path_buf(),
            magic,
            max_file_size,
            state: Mutex::new(FlatFileState {
                current_file,
                current_size,
                unsynced: BTreeSet::new(),
            }),
        })
    }

    fn path(&self, prefix: &str, file: u32) -> PathBuf {
        self.dir.join(file_name(prefix, file))
    }

    fn append(&self, prefix: &str, file: u32, payload: &[u8]) -> Result<u64> {
        let mut out = OpenOptions::new().create(true).append(true).open(self.path(prefix, file))?;
        let start = out.seek(SeekFrom::End(0))?;
        let mut record = Vec::with_capacity(payload.len() + FRAME_SIZE as usize);
        record.extend_from_slice(&self.magic);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(payload);
        out.write_all(&record)?;
        Ok(start + FRAME_SIZE)
    }

    /// Files with writes not yet synced to disk
    pub fn unsynced_files(&self) -> Vec<String> {
        let state = self.state.lock();
        state.unsynced.iter().map(|(prefix, file)| file_name(prefix, *file)).collect()
    }

    fn read_record(&self, prefix: &str, pos: BlockPos) -> Result<Vec<u8>> {
        if pos.offset < FRAME_SIZE {
            return Err(missing(prefix, pos));
        }
        let mut file = File::open(self.path(prefix, pos.file)).map_err(|_| missing(prefix, pos))?;
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(pos.offset - FRAME_SIZE))?;
        let mut frame = [0u8; FRAME_SIZE as usize];
        file.read_exact(&mut frame)?;
        if frame[..4] != self.magic {
            return Err(ConsensusError::Storage(format!(
                "bad magic in {} at offset {}",
                file_name(prefix, pos.file),
                pos.offset
            )));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&frame[4..]);
        let len = u64::from(u32::from_le_bytes(len));
        let limit = if prefix == "blk" {
            MAX_BLOCK_SERIALIZED_SIZE as u64
        } else {
            MAX_SIZE
        };
        if len > limit || len > file_len.saturating_sub(pos.offset) {
            return Err(ConsensusError::Storage(format!(
                "corrupt record length {} in {} at offset {}",
                len,
                file_name(prefix, pos.file),
                pos.offset
            )));
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }
}

impl BlockStore for FlatFileBlockStore {
    fn write_block(&self, block: &Block) -> Result<BlockPos> {
        let payload = block.to_bytes();
        let mut state = self.state.lock();
        if state.current_size > 0 && state.current_size + payload.len() as u64 + FRAME_SIZE > self.max_file_size {
            state.current_file += 1;
            state.current_size = 0;
            debug!("starting block file {}", state.current_file);
        }
        let offset = self.append("blk", state.current_file, &payload)?;
        state.current_size = offset + payload.len() as u64;
        let file = state.current_file;
        state.unsynced.insert(("blk", file));
        Ok(BlockPos {
            file: state.current_file,
            offset,
        })
    }

    fn read_block(&self, pos: BlockPos) -> Result<Block> {
        Block::from_bytes(&self.read_record("blk", pos)?)
    }

    fn write_undo(&self, block_pos: BlockPos, prev_hash: &BlockHash, undo: &BlockSpentOutputs) -> Result<BlockPos> {
        let mut state = self.state.lock();
        let offset = self.append("rev", block_pos.file, &encode_undo_record(prev_hash, undo))?;
        state.unsynced.insert(("rev", block_pos.file));
        Ok(BlockPos {
            file: block_pos.file,
            offset,
        })
    }

    fn read_undo(&self, pos: BlockPos, prev_hash: &BlockHash) -> Result<BlockSpentOutputs> {
        decode_undo_record(&self.read_record("rev", pos)?, prev_hash)
    }

    fn block_positions(&self) -> Result<Vec<BlockPos>> {
        let last = self.state.lock().current_file;
        let mut positions = Vec::new();
        for file in 0..=last {
            let path = self.path("blk", file);
            if !path.exists() {
                continue;
            }
            for (offset, _) in scan_records(&fs::read(&path)?, &self.magic) {
                positions.push(BlockPos { file, offset });
            }
        }
        Ok(positions)
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        let files: Vec<_> = state.unsynced.iter().copied().collect();
        for (prefix, file) in files {
            File::open(self.path(prefix, file))?.sync_all()?;
            state.unsynced.remove(&(prefix, file));
        }
        Ok(())
    }
}

/// Framed records of a block file as (payload offset, payload)
///
/// Bytes between records that do not start with `magic` are skipped, as are
/// zero-filled preallocated tails.
pub fn scan_records<'a>(data: &'a [u8], magic: &[u8; 4]) -> Vec<(u64, &'a [u8])> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos + FRAME_SIZE as usize <= data.len() {
        if data[pos..pos + 4] != magic[..] {
            pos += 1;
            continue;
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&data[pos + 4..pos + 8]);
        let len = u32::from_le_bytes(len) as usize;
        let start = pos + FRAME_SIZE as usize;
        if data.len() - start < len {
            break;
        }
        records.push((start as u64, &data[start..start + len]));
        pos = start + len;
    }
    records
}

/// Blocks of an external block file, in file order
///
/// Records that fail to decode are skipped with a warning.
pub fn read_block_file(path: &Path, magic: &[u8; 4]) -> Result<Vec<Block>> {
    let data = fs::read(path)
        .map_err(|e| ConsensusError::Storage(format!("cannot read {}: {}", path.display(), e)))?;
    let mut blocks = Vec::new();
    for (offset, payload) in scan_records(&data, magic) {
        match Block::from_bytes(payload) {
            Ok(block) => blocks.push(block),
            Err(err) => warn!("skipping undecodable block at {}:{}: {}", path.display(), offset, err),
        }
    }
    Ok(blocks)
}
