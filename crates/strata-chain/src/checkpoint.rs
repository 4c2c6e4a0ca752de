//! Checkpoint policy.
//!
//! Checkpoints pin `(height, hash)` pairs from [`ChainParams`]. A block at a
//! checkpoint height must carry the pinned hash, no reorg may disconnect a
//! block at or below the last checkpoint, and signature checks are skipped
//! for blocks at or below it.
//!
//! # Attack vectors
//!
//! - **Long-range rewrite:** without checkpoints an attacker with enough
//!   work or stake could rewrite arbitrarily deep history. Pinned blocks
//!   make forks below the last checkpoint unacceptable outright.
//! - **Checkpoint spoofing:** the list is compiled into the binary; changing
//!   it requires distributing a modified binary.

use strata_core::error::BlockError;
use strata_core::params::ChainParams;
use strata_core::types::Hash256;

/// Verify a block at `height` against any checkpoint pinned there.
pub fn check_checkpoint(params: &ChainParams, height: u32, hash: &Hash256) -> Result<(), BlockError> {
    match params.checkpoints.iter().find(|(h, _)| *h == height) {
        Some((_, expected)) if expected != hash => Err(BlockError::CheckpointMismatch(height)),
        _ => Ok(()),
    }
}

/// Whether `height` is at or below the last checkpoint.
///
/// Blocks there may not be disconnected.
pub fn is_below_checkpoint(params: &ChainParams, height: u32) -> bool {
    !params.checkpoints.is_empty() && height <= params.last_checkpoint_height()
}

/// Whether signatures of a block at `height` must be verified.
pub fn should_verify_scripts(params: &ChainParams, height: u32) -> bool {
    !is_below_checkpoint(params, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_checkpoints() -> ChainParams {
        let mut params = ChainParams::regtest();
        params.checkpoints = vec![(10, Hash256([0xAA; 32])), (50, Hash256([0xBB; 32]))];
        params
    }

    // --- check_checkpoint ---

    #[test]
    fn checkpoint_passes_for_matching_hash() {
        let params = with_checkpoints();
        assert!(check_checkpoint(&params, 10, &Hash256([0xAA; 32])).is_ok());
        assert!(check_checkpoint(&params, 50, &Hash256([0xBB; 32])).is_ok());
    }

    #[test]
    fn checkpoint_fails_for_wrong_hash() {
        let params = with_checkpoints();
        assert_eq!(
            check_checkpoint(&params, 10, &Hash256([0xFF; 32])),
            Err(BlockError::CheckpointMismatch(10))
        );
    }

    #[test]
    fn no_checkpoint_at_height_passes() {
        let params = with_checkpoints();
        for height in [0, 5, 11, 49, 100, u32::MAX] {
            assert!(check_checkpoint(&params, height, &Hash256([0xDE; 32])).is_ok());
        }
    }

    // --- is_below_checkpoint / should_verify_scripts ---

    #[test]
    fn below_checkpoint_boundary() {
        let params = with_checkpoints();
        assert!(is_below_checkpoint(&params, 0));
        assert!(is_below_checkpoint(&params, 50));
        assert!(!is_below_checkpoint(&params, 51));
        assert!(!should_verify_scripts(&params, 50));
        assert!(should_verify_scripts(&params, 51));
    }

    #[test]
    fn regtest_has_no_checkpoints() {
        let params = ChainParams::regtest();
        assert!(!is_below_checkpoint(&params, 0));
        assert!(should_verify_scripts(&params, 0));
    }

    #[test]
    fn mainnet_pins_genesis_only() {
        let params = ChainParams::mainnet();
        assert!(is_below_checkpoint(&params, 0));
        assert!(!is_below_checkpoint(&params, 1));
    }
}
