//! Property tests over the chain state.
//!
//! Chain-building properties mine real blocks, so they run few cases; the
//! pure transaction checks run the proptest default.

use proptest::prelude::*;
use strata_chain::BlockOutcome;
use strata_core::constants::MAX_MONEY;
use strata_core::types::{Block, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use strata_core::validation;
use strata_tests::helpers::*;

// --- Helpers ---

/// Two branches off genesis: `a_len` blocks a minute apart and `b_len`
/// blocks 61 seconds apart, mined on separate chain states.
fn branches(a_len: u32, b_len: u32) -> (Vec<Block>, Vec<Block>) {
    let mut chain = regtest_chain();
    let genesis = tip_block(&chain);
    let a = mine_on(&mut chain, &miner(1), &genesis, a_len, 60);
    let mut other = regtest_chain();
    let b = mine_on(&mut other, &miner(2), &genesis, b_len, 61);
    (a, b)
}

fn tx_paying(values: &[u64]) -> Transaction {
    Transaction {
        version: 1,
        time: T0,
        inputs: vec![TxInput::new(OutPoint::new(Hash256([7; 32]), 0), vec![0; 98])],
        outputs: values
            .iter()
            .map(|&value| TxOutput {
                value,
                script_pubkey: vec![0x76; 34],
            })
            .collect(),
        lock_time: 0,
    }
}

// --- Transaction ranges ---

proptest! {
    #[test]
    fn accepted_transactions_stay_in_money_range(values in prop::collection::vec(any::<u64>(), 1..5)) {
        let tx = tx_paying(&values);
        let result = validation::check_transaction(&tx);
        let total = values.iter().try_fold(0u64, |acc, v| acc.checked_add(*v));
        let in_range = values.iter().all(|v| *v <= MAX_MONEY) && total.is_some_and(|t| t <= MAX_MONEY);
        prop_assert_eq!(result.is_ok(), in_range, "values {:?}", values);
    }

    #[test]
    fn small_outputs_are_in_range(values in prop::collection::vec(1u64..=MAX_MONEY / 8, 1..5)) {
        prop_assert!(validation::check_transaction(&tx_paying(&values)).is_ok());
    }
}

// --- Chain selection ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn reorg_there_and_back_restores_coins(trunk_len in 1u32..5, a_len in 1u32..4) {
        let mut chain = regtest_chain();
        let trunk = extend_tip(&mut chain, &miner(3), trunk_len);
        let fork = trunk.last().unwrap().clone();
        let a = mine_on(&mut chain, &miner(4), &fork, a_len, 60);

        let watched: Vec<Hash256> = txids_of(&trunk).into_iter().chain(txids_of(&a)).collect();
        let before = coins_of(&mut chain, &watched);
        let supply_before = chain.money_supply();

        // One block longer than A takes over...
        let b = mine_on(&mut chain, &miner(5), &fork, a_len + 1, 60);
        prop_assert_eq!(chain.tip_hash(), b.last().unwrap().hash());
        for block in &a {
            prop_assert!(chain.utxo(&coinbase_out(block)).unwrap().is_none());
        }

        // ...and two more on A take it back.
        let a_more = mine_on(&mut chain, &miner(4), a.last().unwrap(), 2, 60);
        prop_assert_eq!(chain.tip_hash(), a_more[1].hash());
        prop_assert_eq!(coins_of(&mut chain, &watched), before);
        for block in &b {
            prop_assert!(chain.utxo(&coinbase_out(block)).unwrap().is_none());
        }
        prop_assert!(chain.money_supply() > supply_before);
    }

    #[test]
    fn delivery_order_does_not_change_the_tip(order in Just((0..7usize).collect::<Vec<_>>()).prop_shuffle()) {
        let (a, b) = branches(3, 4);
        let all: Vec<Block> = a.iter().chain(&b).cloned().collect();

        let mut chain = regtest_chain();
        for i in order {
            // Children ahead of their parents wait as orphans.
            let _ = chain.process_block(all[i].clone());
        }
        prop_assert_eq!(chain.orphan_block_count(), 0);
        prop_assert_eq!(chain.height(), 4);
        prop_assert_eq!(chain.tip_hash(), b[3].hash());
    }

    #[test]
    fn replaying_blocks_is_idempotent(count in 1u32..6) {
        let mut source = regtest_chain();
        let blocks = extend_tip(&mut source, &miner(6), count);

        let mut chain = regtest_chain();
        for block in &blocks {
            chain.process_block(block.clone()).unwrap();
        }
        let tip = chain.tip_hash();
        let supply = chain.money_supply();
        for block in &blocks {
            prop_assert_eq!(
                chain.process_block(block.clone()).unwrap(),
                BlockOutcome::Duplicate { hash: block.hash() }
            );
        }
        prop_assert_eq!(chain.tip_hash(), tip);
        prop_assert_eq!(chain.money_supply(), supply);
        prop_assert_eq!(chain.height(), count);
    }

    #[test]
    fn tip_trust_never_decreases(lens in prop::collection::vec(1u32..4, 1..4)) {
        let mut chain = regtest_chain();
        let genesis = tip_block(&chain);
        let mut best = chain.tip_entry().unwrap().trust;
        for (i, len) in lens.into_iter().enumerate() {
            mine_on(&mut chain, &miner(10 + i as u8), &genesis, len, 60 + i as u32);
            let trust = chain.tip_entry().unwrap().trust;
            prop_assert!(trust >= best);
            best = trust;
        }
    }
}
