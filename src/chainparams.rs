//! Network parameters
//!
//! Each [`ChainType`] fixes a genesis block, the proof-of-work rules, the
//! subsidy schedule and the heights at which buried soft forks became active.
//! The engine never consults a global network setting; a [`ChainParams`] value
//! travels with the [`Context`](crate::context::Context).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::hashes::block_merkle_root;
use crate::opcodes::OP_CHECKSIG;
use crate::pow::U256;
use crate::script::{ScriptBuilder, VerificationFlags};
use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Mainnet,
    Testnet,
    Testnet4,
    Signet,
    Regtest,
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainType::Mainnet => "main",
            ChainType::Testnet => "test",
            ChainType::Testnet4 => "testnet4",
            ChainType::Signet => "signet",
            ChainType::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for ChainType {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "main" | "mainnet" => Ok(ChainType::Mainnet),
            "test" | "testnet" | "testnet3" => Ok(ChainType::Testnet),
            "testnet4" => Ok(ChainType::Testnet4),
            "signet" => Ok(ChainType::Signet),
            "regtest" => Ok(ChainType::Regtest),
            other => Err(ConsensusError::InvalidArgument(format!("unknown chain type {:?}", other))),
        }
    }
}

/// Activation heights of the buried deployments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployments {
    /// Coinbase must commit to the block height
    pub bip34: u32,
    /// OP_CHECKLOCKTIMEVERIFY
    pub bip65: u32,
    /// Strict DER signatures
    pub bip66: u32,
    /// Relative lock times (BIP68/112/113)
    pub csv: u32,
    pub segwit: u32,
    pub taproot: u32,
}

impl Deployments {
    /// Everything active from the first block
    pub const fn always_active() -> Self {
        Deployments {
            bip34: 1,
            bip65: 1,
            bip66: 1,
            csv: 1,
            segwit: 0,
            taproot: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub chain_type: ChainType,
    pub genesis: Arc<Block>,
    pub pow_limit: U256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    /// Testnet4 difficulty rules: retarget from the first block of the period
    /// and refuse timewarp at period boundaries
    pub enforce_bip94: bool,
    pub subsidy_halving_interval: u32,
    pub coinbase_maturity: u32,
    pub deployments: Deployments,
    /// Blocks validated with a fixed flag set instead of the height rules
    pub script_flag_exceptions: HashMap<BlockHash, VerificationFlags>,
    pub minimum_chain_work: U256,
    pub message_start: [u8; 4],
    /// Signalling blocks per confirmation window that lock in a version bit
    pub rule_change_activation_threshold: usize,
    pub miner_confirmation_window: usize,
}

impl ChainParams {
    pub fn new(chain_type: ChainType) -> Self {
        match chain_type {
            ChainType::Mainnet => Self::main(),
            ChainType::Testnet => Self::testnet(),
            ChainType::Testnet4 => Self::testnet4(),
            ChainType::Signet => Self::signet(),
            ChainType::Regtest => Self::regtest(),
        }
    }

    pub fn main() -> Self {
        let mut exceptions = HashMap::new();
        // BIP16 exception
        insert_exception(
            &mut exceptions,
            "00000000000002dc756eebf4f49723ed8d30cc28a5f108eb94b1ba88ac4f9c22",
            VerificationFlags::NONE,
        );
        // taproot exception
        insert_exception(
            &mut exceptions,
            "0000000000000000000f14c35b2d841e986ab5441de8c585d5ffe55ea1e395ad",
            VerificationFlags::P2SH | VerificationFlags::WITNESS,
        );
        ChainParams {
            chain_type: ChainType::Mainnet,
            genesis: Arc::new(satoshi_genesis(1231006505, 2083236893, 0x1d00ffff)),
            pow_limit: U256::MAX >> 32,
            pow_target_spacing: 10 * 60,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_allow_min_difficulty_blocks: false,
            pow_no_retargeting: false,
            enforce_bip94: false,
            subsidy_halving_interval: HALVING_INTERVAL,
            coinbase_maturity: COINBASE_MATURITY,
            deployments: Deployments {
                bip34: 227_931,
                bip65: 388_381,
                bip66: 363_725,
                csv: 419_328,
                segwit: 481_824,
                taproot: 709_632,
            },
            script_flag_exceptions: exceptions,
            minimum_chain_work: U256::from_limbs([0x65b1_6d03_5a82_be84, 0xb1f3_b93b, 0, 0]),
            message_start: [0xf9, 0xbe, 0xb4, 0xd9],
            rule_change_activation_threshold: 1916,
            miner_confirmation_window: 2016,
        }
    }

    pub fn testnet() -> Self {
        let mut exceptions = HashMap::new();
        insert_exception(
            &mut exceptions,
            "00000000dd30457c001f4095d208cc1296b0eed002427aa599874af7a432b105",
            VerificationFlags::NONE,
        );
        ChainParams {
            chain_type: ChainType::Testnet,
            genesis: Arc::new(satoshi_genesis(1296688602, 414098458, 0x1d00ffff)),
            pow_allow_min_difficulty_blocks: true,
            deployments: Deployments {
                bip34: 21_111,
                bip65: 581_885,
                bip66: 330_776,
                csv: 770_112,
                segwit: 834_624,
                taproot: 2_011_968,
            },
            script_flag_exceptions: exceptions,
            minimum_chain_work: U256::ZERO,
            message_start: [0x0b, 0x11, 0x09, 0x07],
            rule_change_activation_threshold: 1512,
            miner_confirmation_window: 2016,
            ..Self::main()
        }
    }

    pub fn testnet4() -> Self {
        let message = b"03/May/2024 000000000000000000001ebd58c244970b3aa9d783bb001011fbe8ea8e98e00e";
        let output_script = ScriptBuilder::new()
            .push_slice(&[0u8; 33])
            .push_opcode(OP_CHECKSIG)
            .into_bytes();
        ChainParams {
            chain_type: ChainType::Testnet4,
            genesis: Arc::new(create_genesis_block(
                message,
                output_script,
                1714777860,
                393743547,
                0x1d00ffff,
                1,
                INITIAL_SUBSIDY,
            )),
            pow_allow_min_difficulty_blocks: true,
            enforce_bip94: true,
            deployments: Deployments::always_active(),
            script_flag_exceptions: HashMap::new(),
            minimum_chain_work: U256::ZERO,
            message_start: [0x1c, 0x16, 0x3f, 0x28],
            rule_change_activation_threshold: 1512,
            miner_confirmation_window: 2016,
            ..Self::main()
        }
    }

    pub fn signet() -> Self {
        let (pow_limit, _, _) = U256::from_compact(0x1e0377ae);
        ChainParams {
            chain_type: ChainType::Signet,
            genesis: Arc::new(satoshi_genesis(1598918400, 52613770, 0x1e0377ae)),
            pow_limit,
            deployments: Deployments::always_active(),
            script_flag_exceptions: HashMap::new(),
            minimum_chain_work: U256::ZERO,
            message_start: [0x0a, 0x03, 0xcf, 0x40],
            rule_change_activation_threshold: 1815,
            miner_confirmation_window: 2016,
            ..Self::main()
        }
    }

    pub fn regtest() -> Self {
        ChainParams {
            chain_type: ChainType::Regtest,
            genesis: Arc::new(satoshi_genesis(1296688602, 2, 0x207fffff)),
            pow_limit: U256::MAX >> 1,
            pow_allow_min_difficulty_blocks: true,
            pow_no_retargeting: true,
            subsidy_halving_interval: 150,
            deployments: Deployments::always_active(),
            script_flag_exceptions: HashMap::new(),
            minimum_chain_work: U256::ZERO,
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            rule_change_activation_threshold: 108,
            miner_confirmation_window: 144,
            ..Self::main()
        }
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis.block_hash()
    }

    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }
}

fn insert_exception(map: &mut HashMap<BlockHash, VerificationFlags>, hash: &str, flags: VerificationFlags) {
    if let Ok(hash) = hash.parse::<BlockHash>() {
        map.insert(hash, flags);
    }
}

/// Genesis with the original newspaper headline and output key
fn satoshi_genesis(time: u32, nonce: u32, bits: u32) -> Block {
    let message = b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
    let pubkey = hex_literal_pubkey();
    let output_script = ScriptBuilder::new()
        .push_slice(&pubkey)
        .push_opcode(OP_CHECKSIG)
        .into_bytes();
    create_genesis_block(message, output_script, time, nonce, bits, 1, INITIAL_SUBSIDY)
}

fn hex_literal_pubkey() -> Vec<u8> {
    hex::decode(
        "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f",
    )
    .unwrap_or_default()
}

/// Build a genesis block: one coinbase whose scriptSig pushes the legacy
/// difficulty constant, the number 4 and `message`
pub fn create_genesis_block(
    message: &[u8],
    output_script: ByteString,
    time: u32,
    nonce: u32,
    bits: u32,
    version: i32,
    reward: Integer,
) -> Block {
    let script_sig = ScriptBuilder::new()
        .push_int(486_604_799)
        .push_slice(&[4])
        .push_slice(message)
        .into_bytes();
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
            witness: vec![],
        }],
        outputs: vec![TransactionOutput {
            value: reward,
            script_pubkey: output_script,
        }],
        lock_time: 0,
    };
    let mut block = Block {
        header: BlockHeader {
            version,
            prev_block_hash: BlockHash::all_zeros(),
            merkle_root: [0u8; 32],
            timestamp: time,
            bits,
            nonce,
        },
        transactions: vec![Arc::new(coinbase)],
    };
    block.header.merkle_root = block_merkle_root(&block).0;
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_genesis() {
        let params = ChainParams::main();
        assert_eq!(
            params.genesis.header.merkle_root,
            *"4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                .parse::<BlockHash>()
                .unwrap()
                .as_bytes()
        );
        assert_eq!(
            params.genesis_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_coinbase_script_sig() {
        let params = ChainParams::main();
        let coinbase = params.genesis.coinbase().unwrap();
        assert_eq!(
            hex::encode(&coinbase.inputs[0].script_sig),
            "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73"
        );
    }

    #[test]
    fn test_test_networks_genesis() {
        assert_eq!(
            ChainParams::testnet().genesis_hash().to_string(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
        assert_eq!(
            ChainParams::regtest().genesis_hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
        assert_eq!(
            ChainParams::signet().genesis_hash().to_string(),
            "00000008819873e925422c1ff0f99f7cc9bbb232af63a077a480a3633bee1ef6"
        );
    }

    #[test]
    fn test_pow_limits() {
        assert_eq!(ChainParams::main().pow_limit.to_compact(), 0x1d00ffff);
        assert_eq!(ChainParams::regtest().pow_limit.to_compact(), 0x207fffff);
        assert_eq!(ChainParams::main().difficulty_adjustment_interval(), 2016);
    }

    #[test]
    fn test_chain_type_names() {
        for chain in [
            ChainType::Mainnet,
            ChainType::Testnet,
            ChainType::Testnet4,
            ChainType::Signet,
            ChainType::Regtest,
        ] {
            assert_eq!(chain.to_string().parse::<ChainType>().unwrap(), chain);
            assert_eq!(ChainParams::new(chain).chain_type, chain);
        }
        assert!("moon".parse::<ChainType>().is_err());
    }

    #[test]
    fn test_exceptions_present() {
        let params = ChainParams::main();
        assert_eq!(params.script_flag_exceptions.len(), 2);
        assert!(params
            .script_flag_exceptions
            .values()
            .any(|flags| *flags == VerificationFlags::NONE));
    }
}
