//! # strata-core
//! Foundation types, consensus rules, UTXO views and transaction pools for
//! the Strata protocol. Everything here is synchronous and free of I/O; the
//! chain state machine and the node build on it.

pub mod block_validation;
pub mod coins;
pub mod constants;
pub mod crypto;
pub mod difficulty;
pub mod error;
pub mod fees;
pub mod genesis;
pub mod kernel;
pub mod mempool;
pub mod merkle;
pub mod params;
pub mod reward;
pub mod script;
pub mod store;
pub mod traits;
pub mod types;
pub mod validation;
pub mod view;
