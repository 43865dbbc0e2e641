//! Aureus consensus constants

/// Smallest units per coin
pub const COIN: i64 = 100_000_000;

/// Maximum money supply: 21,000,000 AUR in base units
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Initial block subsidy: 50 AUR
pub const INITIAL_SUBSIDY: i64 = 50 * COIN;

/// Blocks between subsidy halvings on the main network
pub const HALVING_INTERVAL: u32 = 210_000;

/// Coinbase outputs need this many confirmations before they can be spent
pub const COINBASE_MATURITY: u32 = 100;

/// Maximum block weight (BIP141)
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;

/// Maximum serialized size of a block in bytes
pub const MAX_BLOCK_SERIALIZED_SIZE: usize = 4_000_000;

/// Scale factor between base size and weight
pub const WITNESS_SCALE_FACTOR: usize = 4;

/// Maximum block sig-op cost (BIP141)
pub const MAX_BLOCK_SIGOPS_COST: usize = 80_000;

/// Maximum script length in bytes
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single pushed stack element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum combined main and alt stack depth
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of non-push operations per script
pub const MAX_OPS_PER_SCRIPT: usize = 201;

/// Maximum public keys in one CHECKMULTISIG
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Default byte width of script numbers
pub const DEFAULT_SCRIPT_NUM_SIZE: usize = 4;

/// Byte width allowed for CHECKLOCKTIMEVERIFY / CHECKSEQUENCEVERIFY operands
pub const LOCKTIME_SCRIPT_NUM_SIZE: usize = 5;

/// Tapscript: budget consumed per executed signature check (BIP342)
pub const VALIDATION_WEIGHT_PER_SIGOP_PASSED: i64 = 50;

/// Tapscript: budget granted on top of the witness size (BIP342)
pub const VALIDATION_WEIGHT_OFFSET: i64 = 50;

/// Lock time threshold: values below are block heights, above are timestamps
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number for a final input
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// BIP68: sequence lock disabled for this input
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;

/// BIP68: lock is time based (512 second units) instead of height based
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;

/// BIP68: bits of the sequence holding the lock value
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// BIP68: time based locks are expressed in units of 2^9 seconds
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Number of blocks used for the median time past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Blocks may not be more than this many seconds ahead of the adjusted clock
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Coinbase script length bounds
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Witness commitment output header: OP_RETURN, push 36, 0xaa21a9ed
pub const WITNESS_COMMITMENT_HEADER: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

/// Minimum length of a witness commitment output script
pub const MINIMUM_WITNESS_COMMITMENT: usize = 38;

/// Window used to detect unknown version bit signalling
pub const VERSIONBITS_WINDOW: usize = 100;

/// Top bits marking a version-bits style block version
pub const VERSIONBITS_TOP_MASK: i32 = 0xe000_0000u32 as i32;
pub const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;

/// The tip is considered stale for sync purposes after this many seconds
pub const DEFAULT_MAX_TIP_AGE: i64 = 24 * 60 * 60;

/// Upper bound for the script verification worker pool
pub const MAX_SCRIPTCHECK_THREADS: usize = 15;

/// Serialized block header length
pub const BLOCK_HEADER_SIZE: usize = 80;
