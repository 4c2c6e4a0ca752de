//! Protocol constants. All monetary values in base units (1 STRAT = 10^8 units).

use serde::{Deserialize, Serialize};

pub const COIN: u64 = 100_000_000;

pub const CENT: u64 = 1_000_000;

/// Upper bound for any single value or sum of values.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Maximum serialized block size in bytes.
pub const MAX_BLOCK_SIZE: usize = 2_000_000;

/// Block size the fee schedule treats as "full".
pub const MAX_BLOCK_SIZE_GEN: usize = MAX_BLOCK_SIZE / 2;

/// Maximum signature operations per block.
pub const MAX_BLOCK_SIGOPS: usize = MAX_BLOCK_SIZE / 50;

/// Largest transaction relayed by the pool.
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// Maximum signature operations in a pool transaction.
pub const MAX_STANDARD_TX_SIGOPS: usize = MAX_BLOCK_SIGOPS / 5;

/// Largest unlocking script accepted by the pool.
pub const MAX_STANDARD_SCRIPT_SIG_SIZE: usize = 1_650;

/// Base fee per started kilobyte when mining.
pub const MIN_TX_FEE: u64 = 10_000;

/// Base fee per started kilobyte for relay.
pub const MIN_RELAY_TX_FEE: u64 = 10_000;

/// Block bytes below which small transactions ride for free.
pub const FREE_TX_AREA: usize = 27_000;

/// Transactions below this size are free in relay mode.
pub const FREE_TX_SIZE: usize = 1_000;

/// Block bytes set aside for the header and coinbase when pricing fees.
pub const BLOCK_RESERVED_SIZE: usize = 1_000;

/// Number of previous blocks considered for median-time-past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Lock-time values below this are block heights, above are unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Highest block version this node understands.
pub const CURRENT_BLOCK_VERSION: u32 = 1;

/// Highest transaction version relayed by the pool.
pub const CURRENT_TX_VERSION: u32 = 1;

/// Height assigned to coin records synthesized from pool transactions.
pub const MEMPOOL_HEIGHT: u32 = 0x7FFF_FFFF;

/// Maximum number of orphan transactions held.
pub const DEFAULT_MAX_ORPHAN_TXS: usize = 100;

/// Orphan transactions larger than this are never stored.
pub const MAX_ORPHAN_TX_SIZE: usize = 5_000;

/// Seconds before an orphan transaction is dropped.
pub const ORPHAN_TX_EXPIRE_SECS: u64 = 20 * 60;

/// Maximum number of orphan blocks held while their parents are fetched.
pub const MAX_ORPHAN_BLOCKS: usize = 750;

/// Default free relay allowance, in thousands of bytes per ten minutes.
pub const DEFAULT_LIMIT_FREE_RELAY: u64 = 15;

/// Network type: Mainnet, Testnet, or Regtest.
///
/// Selects the [`ChainParams`](crate::params::ChainParams) the engine runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network with lower difficulty.
    Testnet,
    /// Local regression-test network: minimal difficulty, short stake ages.
    Regtest,
}

impl NetworkType {
    /// Four-byte identifier written in front of every flat-file record.
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            Self::Mainnet => *b"STRA",
            Self::Testnet => *b"STRT",
            Self::Regtest => *b"STRR",
        }
    }

    /// Subdirectory name appended to the base data directory path.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

impl std::str::FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Check that a value lies in `[0, MAX_MONEY]`.
pub fn money_range(value: u64) -> bool {
    value <= MAX_MONEY
}
