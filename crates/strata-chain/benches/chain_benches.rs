//! Criterion benchmarks for strata-chain hot paths.
//!
//! Covers: skip-pointer ancestor lookup, locators, and extending the tip by
//! one proof-of-work block.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use strata_chain::mining::Miner;
use strata_chain::Chainstate;
use strata_core::crypto::KeyPair;
use strata_core::params::ChainParams;

const T0: u32 = 1_700_000_000;

fn chain_of(len: u32) -> (Chainstate, Miner) {
    let mut cs = Chainstate::in_memory(ChainParams::regtest(), || u64::from(T0) + 10_000_000).unwrap();
    let miner = Miner::new(KeyPair::from_secret_bytes([1; 32]));
    for i in 1..=len {
        let block = miner.pow_block(&cs, vec![], T0 + 60 * i);
        cs.process_block(block).unwrap();
    }
    (cs, miner)
}

fn bench_index(c: &mut Criterion) {
    let (cs, _) = chain_of(1_000);
    let tip = cs.index().tip().unwrap();

    c.bench_function("ancestor_lookup_1000", |b| {
        b.iter(|| {
            for height in (0..1_000).step_by(37) {
                black_box(cs.index().ancestor(tip, height));
            }
        })
    });

    c.bench_function("locator_1000", |b| b.iter(|| black_box(cs.index().locator(tip))));
}

fn bench_extend(c: &mut Criterion) {
    c.bench_function("extend_tip_one_block", |b| {
        b.iter_batched(
            || {
                let (cs, miner) = chain_of(20);
                let block = miner.pow_block(&cs, vec![], T0 + 60 * 21);
                (cs, block)
            },
            |(mut cs, block)| black_box(cs.process_block(block).unwrap()),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_index, bench_extend);
criterion_main!(benches);
