//! Genesis block definition.
//!
//! The genesis block is the first block in the chain (height 0). It contains
//! a single coinbase whose only output is provably unspendable, so the UTXO
//! set starts with exactly one record that can never be consumed. The block
//! is identified by hash and is not subject to the proof-of-work check.
//!
//! All values come from [`ChainParams`]; every node on a network computes
//! the identical genesis block.

use crate::merkle;
use crate::params::ChainParams;
use crate::script;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// Build the genesis coinbase: height commitment plus message, one unspendable output.
fn genesis_coinbase(params: &ChainParams) -> Transaction {
    let mut script_sig = script::encode_height(0);
    script_sig.extend_from_slice(params.genesis_message);
    Transaction {
        version: 1,
        time: params.genesis_time,
        inputs: vec![TxInput::new(OutPoint::null(), script_sig)],
        outputs: vec![TxOutput {
            value: params.genesis_reward,
            script_pubkey: script::unspendable(params.genesis_message),
        }],
        lock_time: 0,
    }
}

/// The genesis block (height 0) for the given network.
pub fn genesis_block(params: &ChainParams) -> Block {
    let coinbase = genesis_coinbase(params);
    let merkle_root = merkle::merkle_root(&[coinbase.txid()]);
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root,
            time: params.genesis_time,
            bits: params.pow_limit,
            nonce: params.genesis_nonce,
        },
        transactions: vec![coinbase],
        signature: Vec::new(),
    }
}

/// The genesis block header hash.
pub fn genesis_hash(params: &ChainParams) -> Hash256 {
    genesis_block(params).hash()
}

/// Check whether a block is the genesis block by comparing header hashes.
pub fn is_genesis(block: &Block, params: &ChainParams) -> bool {
    block.hash() == genesis_hash(params)
}
