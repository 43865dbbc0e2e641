//! # Aureus Kernel
//!
//! Consensus validation engine of the Aureus (AUR) network, a SHA-256d
//! proof-of-work chain following the Bitcoin protocol.
//!
//! The crate decides whether blocks and transactions are valid, keeps the
//! block tree and the UTXO set, and selects the most-work valid chain.
//! Everything outside consensus (networking, wallets, mempool policy, RPC)
//! talks to it through a small programmatic boundary.
//!
//! ## Architecture
//!
//! Leaf to root:
//! - [`types`], [`serialization`], [`hashes`]: value types and their wire form
//! - [`script`] with [`sighash`], [`signature`], [`segwit`], [`taproot`], [`sigop`]: the script interpreter
//! - [`pow`], [`economic`], [`transaction`], [`block`]: consensus rules
//! - [`chain`], [`coins`], [`storage`]: block tree, UTXO views and persistence collaborators
//! - [`validation`]: the [`ChainstateManager`] driving all of the above
//! - [`context`], [`notifications`], [`config`], [`logging`]: the boundary
//!
//! ## Usage
//!
//! ```no_run
//! use aureus_kernel::{ChainType, ChainstateManager, ChainstateManagerOptions, Context, ContextOptions};
//!
//! let context = Context::new(ContextOptions::new().chain_type(ChainType::Regtest));
//! let options = ChainstateManagerOptions::new("/tmp/aureus", "/tmp/aureus/blocks");
//! let manager = ChainstateManager::new(context, options).unwrap();
//! println!("tip height {}", manager.height());
//! ```

pub mod block;
pub mod chain;
pub mod chainparams;
pub mod coins;
pub mod config;
pub mod constants;
pub mod context;
pub mod economic;
pub mod error;
pub mod hashes;
pub mod logging;
pub mod notifications;
pub mod opcodes;
pub mod pow;
pub mod script;
pub mod segwit;
pub mod serialization;
pub mod sighash;
pub mod signature;
pub mod sigop;
pub mod storage;
pub mod taproot;
pub mod transaction;
pub mod types;
pub mod units;
pub mod validation;
pub mod validation_state;

// Re-export commonly used types
pub use chain::{BlockStatus, BlockTreeEntry, Chain};
pub use chainparams::{ChainParams, ChainType};
pub use config::{ChainstateManagerOptions, KernelConfig};
pub use context::{Context, ContextOptions};
pub use error::{ConsensusError, Result, ScriptVerifyError};
pub use logging::{LogCategory, LogLevel, Logger, LoggingConnection, LoggingOptions};
pub use notifications::{KernelNotifications, SynchronizationState, ValidationInterface, Warning};
pub use script::{verify_script_pubkey, VerificationFlags};
pub use serialization::{Decodable, Encodable};
pub use sighash::PrecomputedTransactionData;
pub use types::*;
pub use validation::{ChainstateManager, ProcessedBlock};
pub use validation_state::{BlockValidationResult, BlockValidationState, ValidationMode};
