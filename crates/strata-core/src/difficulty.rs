//! Compact targets, proof-of-work checks, block trust and retargeting.
//!
//! # Compact encoding
//!
//! `bits` packs a 256-bit target as a one-byte exponent and a 23-bit mantissa
//! (`mantissa * 256^(exponent - 3)`). Bit 23 is a sign flag; negative and
//! overflowing encodings are rejected.
//!
//! # Retarget
//!
//! Proof-of-work and proof-of-stake blocks interleave on one chain but are
//! retargeted independently. For a new block of a given type the caller finds
//! the last two blocks of that type and the target moves as an exponential
//! moving average toward the desired spacing `S`:
//!
//! `new = prev * ((N - 1) * S + 2 * actual) / ((N + 1) * S)`, `N = timespan / S`
//!
//! The product is taken in 512 bits so near-limit targets never wrap. The
//! result is clamped to the type's limit.

use primitive_types::{U256, U512};

use crate::error::BlockError;
use crate::params::ChainParams;
use crate::types::Hash256;

/// Time and bits of a block, as the retarget sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetargetSample {
    pub time: u32,
    pub bits: u32,
}

/// Expand a compact target.
pub fn compact_to_u256(bits: u32) -> Result<U256, BlockError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;

    if bits & 0x0080_0000 != 0 {
        return Err(BlockError::BadCompact(bits));
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        if word != 0 {
            let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
            if overflow {
                return Err(BlockError::BadCompact(bits));
            }
        }
        U256::from(word) << (8 * (size - 3))
    };

    Ok(value)
}

/// Compress a target into compact form, truncating the mantissa.
pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

/// Interpret a hash as a little-endian 256-bit integer.
pub fn hash_to_u256(hash: &Hash256) -> U256 {
    U256::from_little_endian(hash.as_bytes())
}

/// Trust contributed by one block: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> U256 {
    match compact_to_u256(bits) {
        Ok(target) if !target.is_zero() => (!target / (target + U256::one())) + U256::one(),
        _ => U256::zero(),
    }
}

/// Check a header hash against its own compact target and the network limit.
pub fn check_proof_of_work(hash: &Hash256, bits: u32, params: &ChainParams) -> Result<(), BlockError> {
    let target = compact_to_u256(bits)?;
    let limit = compact_to_u256(params.pow_limit)?;
    if target.is_zero() || target > limit {
        return Err(BlockError::TargetAboveLimit(bits));
    }
    if hash_to_u256(hash) > target {
        return Err(BlockError::ProofOfWorkFailed);
    }
    Ok(())
}

/// Limit for the given block type.
pub fn target_limit(is_pos: bool, params: &ChainParams) -> u32 {
    if is_pos {
        params.pos_limit
    } else {
        params.pow_limit
    }
}

/// Required bits for the next block of a given type.
///
/// `last` is the most recent block of that type and `before_last` the one
/// before it. Either being absent (early chain) yields the limit.
pub fn next_target_required(
    last: Option<RetargetSample>,
    before_last: Option<RetargetSample>,
    is_pos: bool,
    params: &ChainParams,
) -> u32 {
    let limit_bits = target_limit(is_pos, params);
    let (Some(last), Some(before_last)) = (last, before_last) else {
        return limit_bits;
    };
    let (Ok(limit), Ok(prev)) = (compact_to_u256(limit_bits), compact_to_u256(last.bits)) else {
        return limit_bits;
    };

    let spacing = u64::from(params.target_spacing);
    let interval = params.retarget_interval();
    let actual = if last.time >= before_last.time {
        u64::from(last.time - before_last.time)
    } else {
        spacing
    };

    let numerator = U512::from((interval - 1) * spacing + 2 * actual);
    let denominator = U512::from((interval + 1) * spacing);
    let scaled = U512::from(prev) * numerator / denominator;

    let new = match U256::try_from(scaled) {
        Ok(v) if !v.is_zero() && v <= limit => v,
        Ok(v) if v.is_zero() => U256::one(),
        _ => limit,
    };
    u256_to_compact(new)
}
