//! # strata-node: Full node: RocksDB, flat files, orchestration.
//!
//! Composes the chain state machine with persistent storage into a running
//! node:
//! - [`storage`]: coins and block index in RocksDB column families
//! - [`flatfiles`]: append-only block and undo files
//! - [`node::Node`]: the global chain lock, inbound event loop, bulk import
//!   and shutdown
//! - [`fee_estimate`]: confirmed fee rates, snapshotted at stop
//! - [`config::NodeConfig`]: layered node configuration

pub mod config;
pub mod error;
pub mod fee_estimate;
pub mod flatfiles;
pub mod node;
pub mod storage;

pub use config::{LogFormat, NodeConfig};
pub use error::NodeError;
pub use node::{ImportStats, Node, NodeEvent};
pub use storage::ChainDb;
