//! Minimum fee schedule.
//!
//! Fees are charged per started kilobyte. Small transactions ride free while
//! the block (or relay budget) has room, outputs below [`CENT`] cost an extra
//! base fee each, and once a block being assembled passes half of
//! [`MAX_BLOCK_SIZE_GEN`] the fee scales up steeply until it is unaffordable.

use crate::constants::{
    CENT, FREE_TX_AREA, FREE_TX_SIZE, MAX_BLOCK_SIZE_GEN, MAX_MONEY, MIN_RELAY_TX_FEE, MIN_TX_FEE,
    money_range,
};
use crate::types::Transaction;

/// Which budget the fee is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeMode {
    /// Inclusion in a block of `block_size` bytes.
    Block,
    /// Relay of a loose transaction.
    Relay,
}

/// Minimum fee for `tx` given the bytes already committed to the block.
pub fn min_fee(tx: &Transaction, block_size: usize, mode: FeeMode, allow_free: bool) -> u64 {
    min_fee_for_size(tx, tx.encoded_size(), block_size, mode, allow_free)
}

/// [`min_fee`] with a precomputed serialized size.
pub fn min_fee_for_size(
    tx: &Transaction,
    size: usize,
    block_size: usize,
    mode: FeeMode,
    allow_free: bool,
) -> u64 {
    let base = match mode {
        FeeMode::Relay => MIN_RELAY_TX_FEE,
        FeeMode::Block => MIN_TX_FEE,
    };
    let new_block_size = block_size.saturating_add(size);
    let mut fee = (1 + size as u64 / 1_000).saturating_mul(base);

    if allow_free {
        let free = match mode {
            FeeMode::Block => new_block_size < FREE_TX_AREA,
            FeeMode::Relay => size < FREE_TX_SIZE,
        };
        if free {
            fee = 0;
        }
    }

    let dust = tx.outputs.iter().filter(|o| o.value < CENT).count() as u64;
    fee = fee.saturating_add(dust.saturating_mul(base));

    if mode == FeeMode::Block && new_block_size >= MAX_BLOCK_SIZE_GEN / 2 {
        if new_block_size >= MAX_BLOCK_SIZE_GEN {
            return MAX_MONEY;
        }
        let factor = (MAX_BLOCK_SIZE_GEN / (MAX_BLOCK_SIZE_GEN - new_block_size)) as u64;
        fee = fee.saturating_mul(factor);
    }

    if !money_range(fee) {
        fee = MAX_MONEY;
    }
    fee
}
