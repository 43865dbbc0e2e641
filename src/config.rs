//! Chainstate manager options and the JSON config file that fills them

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::chainparams::ChainType;
use crate::constants::MAX_SCRIPTCHECK_THREADS;
use crate::error::{ConsensusError, Result};

/// Blocks of work at the current tip's difficulty a header chain may trail
/// the active tip by before its headers are refused
pub const DEFAULT_LOW_WORK_BUFFER: u32 = 144;

/// Coins cache footprint that triggers an automatic flush (bytes)
pub const DEFAULT_COINS_CACHE_SIZE: usize = 450 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainstateManagerOptions {
    pub data_dir: PathBuf,
    pub blocks_dir: PathBuf,
    worker_threads: usize,
    pub(crate) wipe_block_tree: bool,
    pub(crate) wipe_chainstate: bool,
    pub block_tree_in_memory: bool,
    pub chainstate_in_memory: bool,
    pub coins_cache_size: usize,
    pub low_work_buffer: u32,
    /// Fixed "now" in Unix seconds, used instead of the system clock
    pub mock_time: Option<i64>,
}

impl ChainstateManagerOptions {
    pub fn new(data_dir: impl Into<PathBuf>, blocks_dir: impl Into<PathBuf>) -> Self {
        ChainstateManagerOptions {
            data_dir: data_dir.into(),
            blocks_dir: blocks_dir.into(),
            worker_threads: 0,
            wipe_block_tree: false,
            wipe_chainstate: false,
            block_tree_in_memory: false,
            chainstate_in_memory: false,
            coins_cache_size: DEFAULT_COINS_CACHE_SIZE,
            low_work_buffer: DEFAULT_LOW_WORK_BUFFER,
            mock_time: None,
        }
    }

    /// Script verification workers; 0 verifies on the calling thread
    pub fn set_worker_threads(&mut self, threads: usize) {
        self.worker_threads = threads.min(MAX_SCRIPTCHECK_THREADS);
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Wiping the block tree forces a rebuild of the chainstate too, so the
    /// block tree may only be wiped together with it
    pub fn set_wipe(&mut self, block_tree: bool, chainstate: bool) -> Result<()> {
        if block_tree && !chainstate {
            return Err(ConsensusError::InvalidArgument(
                "wiping the block tree requires wiping the chainstate".into(),
            ));
        }
        self.wipe_block_tree = block_tree;
        self.wipe_chainstate = chainstate;
        Ok(())
    }

    pub fn wipe_block_tree(&self) -> bool {
        self.wipe_block_tree
    }

    pub fn wipe_chainstate(&self) -> bool {
        self.wipe_chainstate
    }

    pub fn set_block_tree_db_in_memory(&mut self, in_memory: bool) {
        self.block_tree_in_memory = in_memory;
    }

    pub fn set_chainstate_db_in_memory(&mut self, in_memory: bool) {
        self.chainstate_in_memory = in_memory;
    }
}

/// On-disk configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub chain: ChainType,
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/blocks`
    pub blocks_dir: Option<PathBuf>,
    pub worker_threads: usize,
    pub in_memory: bool,
    pub coins_cache_mib: usize,
    pub low_work_buffer: u32,
    pub reindex: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            chain: ChainType::Mainnet,
            data_dir: PathBuf::from(".aureus"),
            blocks_dir: None,
            worker_threads: 0,
            in_memory: false,
            coins_cache_mib: DEFAULT_COINS_CACHE_SIZE >> 20,
            low_work_buffer: DEFAULT_LOW_WORK_BUFFER,
            reindex: false,
        }
    }
}

impl KernelConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_json(&text).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: KernelConfig = serde_json::from_str(text).context("Invalid kernel configuration")?;
        Ok(config)
    }

    pub fn chainstate_options(&self) -> anyhow::Result<ChainstateManagerOptions> {
        let blocks_dir = self
            .blocks_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("blocks"));
        let mut options = ChainstateManagerOptions::new(self.data_dir.clone(), blocks_dir);
        options.set_worker_threads(self.worker_threads);
        options.set_block_tree_db_in_memory(self.in_memory);
        options.set_chainstate_db_in_memory(self.in_memory);
        options.coins_cache_size = self.coins_cache_mib << 20;
        options.low_work_buffer = self.low_work_buffer;
        options
            .set_wipe(self.reindex, self.reindex)
            .context("Invalid reindex settings")?;
        Ok(options)
    }
}
