//! # strata-chain: block index, chain selection and the chain state machine.
//!
//! Builds on strata-core's context-free and contextual rules:
//!
//! - [`block_index`]: arena of every known header, skip pointers, candidate
//!   ordering and failure propagation.
//! - [`connect`]: applying and undoing one block against a UTXO cache.
//! - [`chainstate`]: accept, select and switch; reorganizations commit only
//!   when the whole new branch connects.
//! - [`mempool_accept`]: pool admission, orphan transactions and the free
//!   relay limiter.

pub mod block_index;
pub mod chainstate;
pub mod checkpoint;
pub mod connect;
pub mod events;
pub mod mempool_accept;
#[cfg(any(test, feature = "testing"))]
pub mod mining;
pub mod sigcheck;

pub use block_index::{BlockId, BlockIndex, BlockIndexEntry, BlockStatus, Validity};
pub use chainstate::{BlockOutcome, ChainStores, Chainstate, ChainstateConfig};
pub use events::{ChainEvent, ChainListener};
pub use mempool_accept::TxOutcome;
pub use sigcheck::SigVerifier;
