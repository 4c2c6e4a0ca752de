//! Proof-of-stake kernel, stake modifier and coin-age.
//!
//! A staker proves eligibility by spending one output in a coinstake whose
//! kernel hash falls under the block target scaled by the output's
//! coin-day weight. The kernel hash commits to the stake modifier of the
//! parent block so a staker cannot precompute future eligibility.
//!
//! Kernel hash input, all little-endian:
//! `modifier(8) || coin_time(4) || prevout.txid(32) || prevout.index(4) || stake_time(4)`

use primitive_types::{U256, U512};

use crate::constants::COIN;
use crate::difficulty::{compact_to_u256, hash_to_u256};
use crate::error::BlockError;
use crate::params::ChainParams;
use crate::types::{Hash256, OutPoint};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// The output being staked, as the kernel sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakeInput {
    pub prevout: OutPoint,
    pub value: u64,
    /// Time of the transaction that created the output.
    pub coin_time: u32,
}

/// Entropy contributed by a block to future stake modifiers.
pub fn entropy_bit(block_hash: &Hash256) -> u8 {
    block_hash.0[0] & 1
}

/// Whether a block at `time` starts a new modifier interval after its parent.
pub fn modifier_interval_crossed(prev_time: u32, time: u32, params: &ChainParams) -> bool {
    let interval = params.modifier_interval.max(1);
    time / interval > prev_time / interval
}

/// Derive a fresh stake modifier.
pub fn next_stake_modifier(prev_modifier: u64, prev_hash: &Hash256, entropy: u8) -> u64 {
    let mut data = Vec::with_capacity(8 + 32 + 1);
    data.extend_from_slice(&prev_modifier.to_le_bytes());
    data.extend_from_slice(prev_hash.as_bytes());
    data.push(entropy);
    let digest = Hash256::sha256d(&data);
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.0[..8]);
    u64::from_le_bytes(word)
}

pub fn kernel_hash(modifier: u64, coin_time: u32, prevout: &OutPoint, stake_time: u32) -> Hash256 {
    let mut data = Vec::with_capacity(8 + 4 + 32 + 4 + 4);
    data.extend_from_slice(&modifier.to_le_bytes());
    data.extend_from_slice(&coin_time.to_le_bytes());
    data.extend_from_slice(prevout.txid.as_bytes());
    data.extend_from_slice(&prevout.index.to_le_bytes());
    data.extend_from_slice(&stake_time.to_le_bytes());
    Hash256::sha256d(&data)
}

/// Coin-day weight of a stake: `value * (min(age, max_age) - min_age) / COIN / 1 day`.
pub fn coin_day_weight(value: u64, age: u64, params: &ChainParams) -> U256 {
    let time_weight = age
        .min(u64::from(params.stake_max_age))
        .saturating_sub(u64::from(params.stake_min_age));
    U256::from(value) * U256::from(time_weight) / U256::from(COIN) / U256::from(SECONDS_PER_DAY)
}

/// Check the stake kernel and return the proof hash.
///
/// The age requirement is checked before the hash, so an input younger than
/// `stake_min_age` fails regardless of how low its kernel hash is.
pub fn check_stake_kernel(
    bits: u32,
    modifier: u64,
    input: &StakeInput,
    stake_time: u32,
    params: &ChainParams,
) -> Result<Hash256, BlockError> {
    let age = u64::from(stake_time.saturating_sub(input.coin_time));
    let min = u64::from(params.stake_min_age);
    if stake_time < input.coin_time || age < min {
        return Err(BlockError::StakeTooYoung { age, min });
    }

    let target = compact_to_u256(bits)?;
    let weight = coin_day_weight(input.value, age, params);
    let weighted: U512 = target.full_mul(weight);

    let proof = kernel_hash(modifier, input.coin_time, &input.prevout, stake_time);
    if U512::from(hash_to_u256(&proof)) > weighted {
        return Err(BlockError::KernelHashTooHigh);
    }
    Ok(proof)
}

/// Coin-age of a set of spent outputs, in coin-days.
///
/// Each input contributes `value * held_seconds`, with the holding time capped
/// at `stake_max_age` and the product capped at `max_input_coin_days`.
/// Inputs younger than `stake_min_age` contribute nothing.
pub fn coin_age(inputs: &[(u64, u32)], tx_time: u32, params: &ChainParams) -> u64 {
    let cap = u128::from(params.max_input_coin_days) * u128::from(COIN) * u128::from(SECONDS_PER_DAY);
    let total: u128 = inputs
        .iter()
        .filter_map(|&(value, coin_time)| {
            let held = tx_time.checked_sub(coin_time)?;
            if held < params.stake_min_age {
                return None;
            }
            let held = held.min(params.stake_max_age);
            Some((u128::from(value) * u128::from(held)).min(cap))
        })
        .sum();
    let days = total / u128::from(COIN) / u128::from(SECONDS_PER_DAY);
    u64::try_from(days).unwrap_or(u64::MAX)
}
