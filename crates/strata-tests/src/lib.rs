//! Cross-crate test suite for Strata.
//!
//! Integration tests drive the chain state machine and the node through
//! whole scenarios: competing forks, reorganizations, double spends, stake
//! rules and restarts. [`helpers`] holds the shared chain builders.

pub mod helpers;
