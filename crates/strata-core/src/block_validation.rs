//! Block validation.
//!
//! Two levels:
//!
//! - **Context-free** ([`check_block`]): layout of coinbase and coinstake,
//!   header proof-of-work, transaction times, merkle root with malleability
//!   detection, sigop ceiling and signature presence.
//! - **Contextual** ([`check_header_contextual`], [`check_block_contextual`]):
//!   rules that need the parent and the chain around it. Difficulty, median
//!   time past, future drift, version, PoW/PoS height windows, finality,
//!   coinbase height commitment, checkpoints and the stake signature.
//!
//! Kernel proofs, duplicate stakes and input checks need the UTXO view and
//! the block index, so the chain state machine runs those itself.
//!
//! The genesis block is identified by hash and skips the proof-of-work check.

use std::collections::HashSet;

use crate::constants::{CURRENT_BLOCK_VERSION, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE};
use crate::crypto;
use crate::difficulty;
use crate::error::BlockError;
use crate::merkle;
use crate::params::ChainParams;
use crate::script;
use crate::types::{Block, BlockHeader};
use crate::validation;

/// Chain context for a block about to be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    /// Height the block would occupy.
    pub height: u32,
    /// Bits the retarget expects for this block's type.
    pub expected_bits: u32,
    /// Median time of the previous [`MEDIAN_TIME_SPAN`](crate::constants::MEDIAN_TIME_SPAN) blocks.
    pub median_time_past: u32,
    /// Network-adjusted clock, in seconds.
    pub adjusted_time: u64,
    /// Height of the highest checkpoint already present in the index.
    pub known_checkpoint_height: Option<u32>,
}

/// Context-free block checks.
///
/// `check_pow` is false for the genesis block and when re-checking a block
/// whose header was already proven.
pub fn check_block(block: &Block, params: &ChainParams, check_pow: bool) -> Result<(), BlockError> {
    let size = block.encoded_size();
    if size > MAX_BLOCK_SIZE {
        return Err(BlockError::Oversized {
            size,
            max: MAX_BLOCK_SIZE,
        });
    }

    let Some(coinbase) = block.transactions.first() else {
        return Err(BlockError::NoTransactions);
    };
    if !coinbase.is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }
    if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
        return Err(BlockError::MultipleCoinbase);
    }
    if let Some(i) = block
        .transactions
        .iter()
        .enumerate()
        .skip(2)
        .find_map(|(i, tx)| tx.is_coinstake().then_some(i))
    {
        return Err(BlockError::CoinstakeMisplaced(i));
    }

    let is_pos = block.is_proof_of_stake();
    if is_pos {
        if coinbase.outputs.len() != 1 || !coinbase.outputs[0].is_empty() {
            return Err(BlockError::StakeCoinbaseNotEmpty);
        }
    } else if check_pow {
        difficulty::check_proof_of_work(&block.hash(), block.header.bits, params)?;
    }

    for (i, tx) in block.transactions.iter().enumerate() {
        if tx.time > block.header.time {
            return Err(BlockError::TxTimeAfterBlock(i));
        }
    }
    if let Some(coinstake) = block.coinstake() {
        if coinstake.time != block.header.time {
            return Err(BlockError::CoinstakeTimeMismatch);
        }
    }

    for (index, tx) in block.transactions.iter().enumerate() {
        validation::check_transaction(tx)
            .map_err(|source| BlockError::TransactionError { index, source })?;
    }

    let txids = block.txids();
    let (root, mutated) = merkle::merkle_root_checked(&txids);
    if root != block.header.merkle_root {
        return Err(BlockError::MerkleMismatch);
    }
    let mut seen = HashSet::with_capacity(txids.len());
    if mutated || !txids.iter().all(|id| seen.insert(*id)) {
        let dup = txids
            .iter()
            .find(|id| txids.iter().filter(|other| other == id).count() > 1)
            .map(ToString::to_string)
            .unwrap_or_default();
        return Err(BlockError::DuplicateTxid(dup));
    }

    let sigops: usize = block.transactions.iter().map(validation::legacy_sigop_count).sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(BlockError::TooManySigops {
            count: sigops,
            max: MAX_BLOCK_SIGOPS,
        });
    }

    match (is_pos, block.signature.is_empty()) {
        (true, true) => Err(BlockError::MissingSignature),
        (false, false) => Err(BlockError::UnexpectedSignature),
        _ => Ok(()),
    }
}

/// Header rules that need only the parent's position in the index.
pub fn check_header_contextual(
    header: &BlockHeader,
    ctx: &BlockContext,
    params: &ChainParams,
) -> Result<(), BlockError> {
    if header.version < CURRENT_BLOCK_VERSION {
        return Err(BlockError::BadVersion(header.version));
    }

    if header.time <= ctx.median_time_past {
        return Err(BlockError::TimeTooOld {
            time: header.time,
            median: ctx.median_time_past,
        });
    }
    let max = ctx.adjusted_time + u64::from(params.max_future_drift);
    if u64::from(header.time) > max {
        return Err(BlockError::TimeTooNew {
            time: header.time,
            max,
        });
    }

    let hash = header.hash();
    if let Some((_, expected)) = params.checkpoints.iter().find(|(h, _)| *h == ctx.height) {
        if *expected != hash {
            return Err(BlockError::CheckpointMismatch(ctx.height));
        }
    }
    if let Some(checkpoint) = ctx.known_checkpoint_height {
        if ctx.height < checkpoint {
            return Err(BlockError::ForkBelowCheckpoint {
                height: ctx.height,
                checkpoint,
            });
        }
    }

    Ok(())
}

/// Full contextual block checks, header rules included.
pub fn check_block_contextual(
    block: &Block,
    ctx: &BlockContext,
    params: &ChainParams,
) -> Result<(), BlockError> {
    let header = &block.header;
    check_header_contextual(header, ctx, params)?;

    if header.bits != ctx.expected_bits {
        return Err(BlockError::BadDifficulty {
            got: header.bits,
            expected: ctx.expected_bits,
        });
    }

    if block.is_proof_of_stake() {
        if ctx.height < params.first_pos_height {
            return Err(BlockError::StakeBeforeStart(ctx.height));
        }
    } else if ctx.height > params.last_pow_height {
        return Err(BlockError::PowAfterLastPowHeight(ctx.height));
    }

    if let Some(i) = block
        .transactions
        .iter()
        .position(|tx| !tx.is_final(ctx.height, header.time))
    {
        return Err(BlockError::NonFinalTx(i));
    }

    if ctx.height >= params.coinbase_height_activation {
        let commitment = script::encode_height(ctx.height);
        let committed = block
            .coinbase()
            .is_some_and(|cb| cb.inputs[0].script_sig.starts_with(&commitment));
        if !committed {
            return Err(BlockError::BadCoinbaseHeight(ctx.height));
        }
    }

    check_block_signature(block)
}

/// Verify the staker's signature against coinstake output 1.
///
/// Proof-of-work blocks carry no signature and pass trivially.
pub fn check_block_signature(block: &Block) -> Result<(), BlockError> {
    let Some(coinstake) = block.coinstake() else {
        return Ok(());
    };
    let locking = &coinstake.outputs[1].script_pubkey;
    crypto::verify_block_signature(block, locking).map_err(|_| BlockError::BadSignature)
}
