//! Block and transaction builders for tests and regtest tooling.
//!
//! Nothing here is consensus code: a [`Miner`] assembles well-formed
//! proof-of-work and proof-of-stake blocks on top of any indexed parent and
//! grinds nonces against the regtest limit. Coinbases claim only the
//! subsidy, so fees are burned.

use strata_core::constants::{CURRENT_BLOCK_VERSION, CURRENT_TX_VERSION, MIN_TX_FEE};
use strata_core::crypto::{self, KeyPair};
use strata_core::difficulty;
use strata_core::merkle;
use strata_core::params::ChainParams;
use strata_core::reward;
use strata_core::script;
use strata_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

use crate::chainstate::Chainstate;

/// Coinbase committing to `height`. The time doubles as an extra nonce so
/// sibling coinbases get distinct txids.
pub fn coinbase(height: u32, time: u32, outputs: Vec<TxOutput>) -> Transaction {
    let mut script_sig = script::encode_height(height);
    script_sig.extend_from_slice(&time.to_le_bytes());
    Transaction {
        version: CURRENT_TX_VERSION,
        time,
        inputs: vec![TxInput::new(OutPoint::null(), script_sig)],
        outputs,
        lock_time: 0,
    }
}

/// Grind the nonce until the header meets its own target.
pub fn solve(block: &mut Block, params: &ChainParams) {
    block.header.nonce = 0;
    while difficulty::check_proof_of_work(&block.hash(), block.header.bits, params).is_err() {
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
}

fn assemble(prev_hash: Hash256, bits: u32, time: u32, transactions: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    Block {
        header: BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            prev_hash,
            merkle_root: merkle::merkle_root(&txids),
            time,
            bits,
            nonce: 0,
        },
        transactions,
        signature: Vec::new(),
    }
}

/// Builds blocks paying to, and transactions signed by, one key.
#[derive(Debug)]
pub struct Miner {
    key: KeyPair,
}

impl Miner {
    pub fn new(key: KeyPair) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    pub fn script(&self) -> Vec<u8> {
        self.key.locking_script()
    }

    /// Proof-of-work block on the active tip.
    pub fn pow_block(&self, chain: &Chainstate, txs: Vec<Transaction>, time: u32) -> Block {
        self.pow_block_at(chain, &chain.tip_hash(), txs, time)
    }

    /// Proof-of-work block on an indexed parent, at the difficulty the
    /// index expects.
    ///
    /// # Panics
    ///
    /// When `parent` is not in the index.
    pub fn pow_block_at(&self, chain: &Chainstate, parent: &Hash256, txs: Vec<Transaction>, time: u32) -> Block {
        let index = chain.index();
        let id = index.lookup(parent).expect("parent must be indexed");
        let height = index.get(id).height + 1;
        let bits = index.next_work_required(id, false, chain.params());
        self.pow_on(chain.params(), *parent, height, bits, txs, time)
    }

    /// Proof-of-work child of a block that need not be indexed yet.
    pub fn pow_child(
        &self,
        params: &ChainParams,
        parent: &Block,
        height: u32,
        bits: u32,
        txs: Vec<Transaction>,
        time: u32,
    ) -> Block {
        self.pow_on(params, parent.hash(), height, bits, txs, time)
    }

    fn pow_on(
        &self,
        params: &ChainParams,
        prev_hash: Hash256,
        height: u32,
        bits: u32,
        txs: Vec<Transaction>,
        time: u32,
    ) -> Block {
        let reward = TxOutput {
            value: reward::block_subsidy(height, params),
            script_pubkey: self.script(),
        };
        let mut transactions = vec![coinbase(height, time, vec![reward])];
        transactions.extend(txs);
        let mut block = assemble(prev_hash, bits, time, transactions);
        solve(&mut block, params);
        block
    }

    /// Proof-of-stake block on an indexed parent.
    ///
    /// The coinstake spends `stake` (worth `stake_value`, owned by this key)
    /// and pays back `stake_value + reward` in output 1.
    ///
    /// # Panics
    ///
    /// When `parent` is not in the index.
    #[allow(clippy::too_many_arguments)]
    pub fn pos_block_at(
        &self,
        chain: &Chainstate,
        parent: &Hash256,
        stake: OutPoint,
        stake_value: u64,
        reward: u64,
        txs: Vec<Transaction>,
        time: u32,
    ) -> Block {
        let index = chain.index();
        let id = index.lookup(parent).expect("parent must be indexed");
        let height = index.get(id).height + 1;
        let bits = index.next_work_required(id, true, chain.params());

        let mut coinstake = Transaction {
            version: CURRENT_TX_VERSION,
            time,
            inputs: vec![TxInput::new(stake, Vec::new())],
            outputs: vec![
                TxOutput::empty(),
                TxOutput {
                    value: stake_value + reward,
                    script_pubkey: self.script(),
                },
            ],
            lock_time: 0,
        };
        crypto::sign_transaction_input(&mut coinstake, 0, &self.key).expect("input 0 exists");

        let mut transactions = vec![coinbase(height, time, vec![TxOutput::empty()]), coinstake];
        transactions.extend(txs);
        let mut block = assemble(*parent, bits, time, transactions);
        crypto::sign_block(&mut block, &self.key);
        block
    }

    /// Spend one output owned by this key back to it, paying [`MIN_TX_FEE`].
    pub fn spend(&self, prevout: OutPoint, value: u64, time: u32) -> Transaction {
        let output = TxOutput {
            value: value - MIN_TX_FEE,
            script_pubkey: self.script(),
        };
        self.spend_with_fee(&[(prevout, value)], vec![output], time)
    }

    /// Spend outputs owned by this key into arbitrary outputs. The fee is
    /// whatever the inputs leave over.
    pub fn spend_with_fee(&self, inputs: &[(OutPoint, u64)], outputs: Vec<TxOutput>, time: u32) -> Transaction {
        let mut tx = Transaction {
            version: CURRENT_TX_VERSION,
            time,
            inputs: inputs
                .iter()
                .map(|(prevout, _)| TxInput::new(*prevout, Vec::new()))
                .collect(),
            outputs,
            lock_time: 0,
        };
        for i in 0..tx.inputs.len() {
            crypto::sign_transaction_input(&mut tx, i, &self.key).expect("input index in range");
        }
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::block_validation;

    #[test]
    fn pow_block_passes_context_free_checks() {
        let params = ChainParams::regtest();
        let genesis = strata_core::genesis::genesis_block(&params);
        let m = Miner::new(KeyPair::from_secret_bytes([1; 32]));
        let block = m.pow_child(&params, &genesis, 1, params.pow_limit, vec![], params.genesis_time + 60);
        assert!(block_validation::check_block(&block, &params, true).is_ok());
        assert_eq!(block.transactions[0].outputs[0].value, reward::block_subsidy(1, &params));
    }

    #[test]
    fn sibling_coinbases_differ() {
        let a = coinbase(5, 100, vec![]);
        let b = coinbase(5, 101, vec![]);
        assert_ne!(a.txid(), b.txid());
    }
}
