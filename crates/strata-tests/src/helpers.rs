//! Shared test helpers for scenario and integration tests.
//!
//! These panic on unexpected failures; they are only used from tests.

use std::path::Path;

use strata_chain::mining::Miner;
use strata_chain::{BlockOutcome, Chainstate};
use strata_core::coins::Coins;
use strata_core::constants::NetworkType;
use strata_core::crypto::KeyPair;
use strata_core::params::ChainParams;
use strata_core::types::{Block, Hash256, OutPoint, Transaction};
use strata_node_lib::NodeConfig;

/// Regtest genesis time.
pub const T0: u32 = 1_700_000_000;

/// Wall clock of test chains: far enough ahead that no test block is in
/// the future.
pub const NOW: u64 = T0 as u64 + 10_000_000;

/// In-memory regtest chain state at genesis.
pub fn regtest_chain() -> Chainstate {
    Chainstate::in_memory(ChainParams::regtest(), || NOW).expect("in-memory chain state opens")
}

/// Miner whose key is derived from a seed byte.
pub fn miner(seed: u8) -> Miner {
    Miner::new(KeyPair::from_secret_bytes([seed; 32]))
}

/// The block at the active tip.
pub fn tip_block(chain: &Chainstate) -> Block {
    chain
        .block(&chain.tip_hash())
        .expect("block store readable")
        .expect("tip block stored")
}

/// Mine `count` proof-of-work blocks on `parent`, `spacing` seconds apart,
/// handing each to the chain state. Returns them oldest first.
pub fn mine_on(chain: &mut Chainstate, miner: &Miner, parent: &Block, count: u32, spacing: u32) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count as usize);
    let mut parent = parent.clone();
    for _ in 0..count {
        let block = miner.pow_block_at(chain, &parent.hash(), vec![], parent.header.time + spacing);
        let outcome = chain.process_block(block.clone()).expect("mined block accepted");
        assert!(matches!(outcome, BlockOutcome::Accepted { .. }));
        parent = block.clone();
        blocks.push(block);
    }
    blocks
}

/// Extend the active tip by `count` blocks one minute apart.
pub fn extend_tip(chain: &mut Chainstate, miner: &Miner, count: u32) -> Vec<Block> {
    let tip = tip_block(chain);
    mine_on(chain, miner, &tip, count, 60)
}

/// Output 0 of the block's coinbase.
pub fn coinbase_out(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

/// Coin records of `txids` as of the active tip.
pub fn coins_of(chain: &mut Chainstate, txids: &[Hash256]) -> Vec<Option<Coins>> {
    txids
        .iter()
        .map(|txid| chain.coins(txid).expect("coins view readable"))
        .collect()
}

/// Every txid in `blocks`.
pub fn txids_of(blocks: &[Block]) -> Vec<Hash256> {
    blocks
        .iter()
        .flat_map(|b| b.transactions.iter().map(Transaction::txid))
        .collect()
}

/// Regtest node configuration rooted at `dir`.
pub fn node_config(dir: &Path) -> NodeConfig {
    NodeConfig {
        data_dir: dir.to_path_buf(),
        network: NetworkType::Regtest,
        ..NodeConfig::default()
    }
}
