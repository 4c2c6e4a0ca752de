//! Per-network chain parameters.
//!
//! [`ChainParams`] is constructed once at startup and shared read-only by
//! every consensus check. Regtest uses near-maximal targets and short stake
//! ages so tests can build chains quickly.

use crate::constants::{COIN, NetworkType};
use crate::types::Hash256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub network: NetworkType,

    /// Genesis header time.
    pub genesis_time: u32,
    /// Genesis header nonce.
    pub genesis_nonce: u32,
    /// Free-form bytes embedded in the genesis coinbase.
    pub genesis_message: &'static [u8],
    /// Value of the single unspendable genesis output.
    pub genesis_reward: u64,

    /// Easiest allowed proof-of-work target (compact).
    pub pow_limit: u32,
    /// Easiest allowed proof-of-stake target (compact).
    pub pos_limit: u32,
    /// Desired seconds between blocks of the same type.
    pub target_spacing: u32,
    /// Averaging window of the retarget, in seconds.
    pub target_timespan: u32,

    /// Confirmations before coinbase and coinstake outputs may be spent.
    pub coinbase_maturity: u32,
    /// Seconds an output must age before it may stake.
    pub stake_min_age: u32,
    /// Age beyond which an output stops accruing stake weight.
    pub stake_max_age: u32,
    /// Coin-age cap per input, in coin-days.
    pub max_input_coin_days: u64,
    /// Seconds between stake modifier regenerations.
    pub modifier_interval: u32,

    /// Highest height at which a proof-of-work block is accepted.
    pub last_pow_height: u32,
    /// Lowest height at which a proof-of-stake block is accepted.
    pub first_pos_height: u32,
    /// Seconds a block time may run ahead of the adjusted clock.
    pub max_future_drift: u32,
    /// Height from which coinbases must commit to their height.
    pub coinbase_height_activation: u32,

    /// Proof-of-work subsidy at height 1.
    pub initial_reward: u64,
    /// Blocks between subsidy halvings.
    pub halving_interval: u32,
    /// Annual stake interest, in base units per coin-year.
    pub stake_coin_year_reward: u64,

    /// Hard-coded `(height, hash)` pairs the active chain must contain.
    pub checkpoints: Vec<(u32, Hash256)>,
}

impl ChainParams {
    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    pub fn mainnet() -> Self {
        let mut params = Self {
            network: NetworkType::Mainnet,
            genesis_time: 1_767_225_600,
            genesis_nonce: 0,
            genesis_message: b"Strata genesis: layered consensus, 2026",
            genesis_reward: 50 * COIN,
            pow_limit: 0x1e0f_ffff,
            pos_limit: 0x1e0f_ffff,
            target_spacing: 60,
            target_timespan: 40 * 60,
            coinbase_maturity: 100,
            stake_min_age: 60 * 60,
            stake_max_age: 30 * 24 * 60 * 60,
            max_input_coin_days: 10_000_000,
            modifier_interval: 60,
            last_pow_height: 259_200,
            first_pos_height: 259_201,
            max_future_drift: 180,
            coinbase_height_activation: 1,
            initial_reward: 50 * COIN,
            halving_interval: 210_000,
            stake_coin_year_reward: crate::constants::CENT,
            checkpoints: Vec::new(),
        };
        params.checkpoints.push((0, crate::genesis::genesis_block(&params).hash()));
        params
    }

    pub fn testnet() -> Self {
        let mut params = Self {
            network: NetworkType::Testnet,
            genesis_message: b"Strata testnet genesis",
            pow_limit: 0x1f0f_ffff,
            pos_limit: 0x1f0f_ffff,
            coinbase_maturity: 15,
            last_pow_height: 200,
            first_pos_height: 201,
            checkpoints: Vec::new(),
            ..Self::mainnet()
        };
        params.checkpoints.push((0, crate::genesis::genesis_block(&params).hash()));
        params
    }

    pub fn regtest() -> Self {
        Self {
            network: NetworkType::Regtest,
            genesis_time: 1_700_000_000,
            genesis_message: b"Strata regtest genesis",
            pow_limit: 0x207f_ffff,
            pos_limit: 0x207f_ffff,
            target_timespan: 10 * 60,
            coinbase_maturity: 10,
            last_pow_height: 1_000_000,
            first_pos_height: 1,
            checkpoints: Vec::new(),
            ..Self::mainnet()
        }
    }

    /// Number of blocks in the retarget averaging window.
    pub fn retarget_interval(&self) -> u64 {
        u64::from((self.target_timespan / self.target_spacing.max(1)).max(1))
    }

    /// Height of the last hard-coded checkpoint, or 0 when there are none.
    pub fn last_checkpoint_height(&self) -> u32 {
        self.checkpoints.iter().map(|(h, _)| *h).max().unwrap_or(0)
    }
}
