//! Core protocol types: transactions, blocks, outpoints.
//!
//! All monetary values are in base units (1 STRAT = 10^8 units).
//! Heights and timestamps are `u32`, matching the on-disk header layout.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::LOCKTIME_THRESHOLD;

/// A 32-byte hash value.
///
/// Used for transaction IDs (BLAKE3), block header hashes (double SHA-256),
/// and merkle roots (BLAKE3). Numeric comparisons read the bytes as a
/// little-endian 256-bit integer.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used for coinbase previous outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Double SHA-256 of arbitrary data.
    pub fn sha256d(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        Self(Sha256::digest(first).into())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Unlocking script. For coinbase inputs, the height commitment plus free data.
    pub script_sig: Vec<u8>,
    /// Input sequence. `u32::MAX` opts out of lock-time.
    pub sequence: u32,
}

impl TxInput {
    pub fn new(previous_output: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            previous_output,
            script_sig,
            sequence: u32::MAX,
        }
    }
}

/// A transaction output, creating a new unspent coin.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in base units.
    pub value: u64,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    /// The zero-value, script-less output that marks a coinstake.
    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

/// A transaction transferring value between scripts.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u32,
    /// Unix timestamp chosen by the creator. Coin age is measured from it.
    pub time: u32,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u32,
}

impl Transaction {
    /// Compute the transaction ID: BLAKE3 over a fixed little-endian layout.
    pub fn txid(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&self.time.to_le_bytes());
        hasher.update(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            hasher.update(input.previous_output.txid.as_bytes());
            hasher.update(&input.previous_output.index.to_le_bytes());
            hasher.update(&(input.script_sig.len() as u64).to_le_bytes());
            hasher.update(&input.script_sig);
            hasher.update(&input.sequence.to_le_bytes());
        }
        hasher.update(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            hasher.update(&output.value.to_le_bytes());
            hasher.update(&(output.script_pubkey.len() as u64).to_le_bytes());
            hasher.update(&output.script_pubkey);
        }
        hasher.update(&self.lock_time.to_le_bytes());
        Hash256(hasher.finalize().into())
    }

    /// Serialized size in bytes (bincode, standard config).
    ///
    /// An encoding failure reports `usize::MAX` so every size ceiling rejects it.
    pub fn encoded_size(&self) -> usize {
        bincode::encode_to_vec(self, bincode::config::standard()).map_or(usize::MAX, |v| v.len())
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// A coinstake spends real inputs and opens with an empty marker output.
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].previous_output.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty()
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Lock-time finality at the given height and block time.
    pub fn is_final(&self, height: u32, block_time: u32) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if self.lock_time < LOCKTIME_THRESHOLD {
            height
        } else {
            block_time
        };
        if self.lock_time < cutoff {
            return true;
        }
        self.inputs.iter().all(|input| input.sequence == u32::MAX)
    }
}

/// Block header.
///
/// Hash is double SHA-256 over a fixed 80-byte little-endian layout.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u32,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// BLAKE3 merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce. Zero for proof-of-stake blocks.
    pub nonce: u32,
}

impl BlockHeader {
    const HASH_SIZE: usize = 4 * 4 + 2 * 32;

    /// Compute the block header hash (double SHA-256).
    ///
    /// Layout: version || prev_hash || merkle_root || time || bits || nonce.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.time.to_le_bytes());
        data.extend_from_slice(&self.bits.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        Hash256::sha256d(&data)
    }
}

/// A complete block: header, transactions and the staker's signature.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// Ordered list of transactions. First is the coinbase; a coinstake may follow.
    pub transactions: Vec<Transaction>,
    /// Signature over the block hash by the staker. Empty on proof-of-work blocks.
    pub signature: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Get the coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// A block is proof-of-stake when its second transaction is a coinstake.
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn coinstake(&self) -> Option<&Transaction> {
        if self.is_proof_of_stake() {
            self.transactions.get(1)
        } else {
            None
        }
    }

    /// The output staked by this block and the coinstake time.
    pub fn proof_of_stake(&self) -> Option<(OutPoint, u32)> {
        self.coinstake()
            .map(|cs| (cs.inputs[0].previous_output, cs.time))
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Serialized size in bytes (bincode, standard config).
    pub fn encoded_size(&self) -> usize {
        bincode::encode_to_vec(self, bincode::config::standard()).map_or(usize::MAX, |v| v.len())
    }
}
