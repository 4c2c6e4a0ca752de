//! Collaborator interfaces of the chain state machine.
//!
//! - [`FlatStore`]: append-only block and undo storage, addressed by [`DiskPos`].
//! - [`IndexStore`]: persisted block index entries plus a few singleton keys.
//! - [`ConsensusHooks`]: predicates owned by outer subsystems (transaction
//!   locks, masternode payments, sporks).
//!
//! The node crate backs the stores with flat files and RocksDB; in-memory
//! versions live in [`crate::store`].

use serde::{Deserialize, Serialize};

use crate::error::FatalError;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction};

/// Location of a record in a flat store.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct DiskPos {
    pub file: u32,
    /// Byte offset of the payload within the file.
    pub offset: u64,
    /// Payload length.
    pub len: u32,
}

/// Append-only record storage.
pub trait FlatStore: Send {
    /// Append a record and return where it landed.
    fn write(&mut self, bytes: &[u8]) -> Result<DiskPos, FatalError>;

    fn read(&self, pos: &DiskPos) -> Result<Vec<u8>, FatalError>;

    /// Make every write so far durable.
    fn flush(&mut self) -> Result<(), FatalError>;
}

/// Singleton keys kept next to the index entries.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexMetaKey {
    /// Number of the block file currently appended to.
    LastFile,
    /// Set while a reindex is in progress.
    Reindexing,
    /// Highest cumulative trust seen on an invalid chain.
    BestInvalidTrust,
}

impl IndexMetaKey {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::LastFile => b"last_file",
            Self::Reindexing => b"reindexing",
            Self::BestInvalidTrust => b"best_invalid_trust",
        }
    }
}

/// Persisted form of one block index entry.
///
/// Trust, skip pointers and arrival order are recomputed on load.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct DiskIndexEntry {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: u32,
    pub status: u32,
    pub block_pos: Option<DiskPos>,
    pub undo_pos: Option<DiskPos>,
    pub tx_count: u32,
    pub money_supply: u64,
    pub mint: u64,
    pub is_proof_of_stake: bool,
    pub entropy_bit: u8,
    pub stake_modifier: u64,
    pub generated_modifier: bool,
    pub stake_source: Option<(OutPoint, u32)>,
    pub proof_hash: Hash256,
}

impl DiskIndexEntry {
    pub fn encode(&self) -> Result<Vec<u8>, FatalError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FatalError::Storage(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FatalError> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(entry, _)| entry)
            .map_err(|e| FatalError::Corruption(format!("index entry: {e}")))
    }
}

/// Persistent block index.
pub trait IndexStore: Send {
    fn load_all(&self) -> Result<Vec<DiskIndexEntry>, FatalError>;

    /// Write entries and meta values in one atomic batch.
    fn write_batch(
        &mut self,
        entries: &[DiskIndexEntry],
        meta: &[(IndexMetaKey, Vec<u8>)],
    ) -> Result<(), FatalError>;

    fn read_meta(&self, key: IndexMetaKey) -> Result<Option<Vec<u8>>, FatalError>;
}

/// Feature switches controlled by the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Spork {
    MasternodePaymentEnforcement,
    TxLockBlockFiltering,
}

/// Predicates supplied by subsystems outside consensus.
pub trait ConsensusHooks: Send + Sync {
    /// Txid of a locked transaction that `tx` conflicts with.
    fn tx_lock_conflict(&self, _tx: &Transaction) -> Option<Hash256> {
        None
    }

    /// Whether the block pays the expected masternode at `height`.
    fn is_block_payee_valid(&self, _block: &Block, _height: u32) -> bool {
        true
    }

    fn is_spork_active(&self, _spork: Spork) -> bool {
        false
    }
}

/// Hooks that accept everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ConsensusHooks for NoopHooks {}
