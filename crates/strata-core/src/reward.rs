//! Reward schedule.
//!
//! Proof-of-work blocks earn a subsidy that halves every
//! [`halving_interval`](ChainParams::halving_interval) blocks. Proof-of-stake
//! blocks earn interest on the coin-age consumed by the coinstake:
//!
//! `reward = coin_days * stake_coin_year_reward * 33 / (365 * 33 + 8)`
//!
//! The `33 / (365 * 33 + 8)` factor is one day over the mean year length.
//! The genesis output is fixed by [`crate::genesis`] and is not governed here.

use crate::params::ChainParams;

/// Proof-of-work subsidy for a block at `height`.
///
/// `initial_reward >> (height / halving_interval)`, zero once the shift would
/// exceed 63.
pub fn block_subsidy(height: u32, params: &ChainParams) -> u64 {
    let epoch = halving_epoch(height, params);
    if epoch >= 64 {
        return 0;
    }
    params.initial_reward >> epoch
}

/// Which halving epoch a height falls in.
pub fn halving_epoch(height: u32, params: &ChainParams) -> u32 {
    height / params.halving_interval.max(1)
}

/// Maximum coinstake reward for the given coin-age.
pub fn stake_reward(coin_days: u64, params: &ChainParams) -> u64 {
    let reward = u128::from(coin_days) * u128::from(params.stake_coin_year_reward) * 33
        / (365 * 33 + 8);
    u64::try_from(reward).unwrap_or(u64::MAX)
}
