//! In-memory pools of unconfirmed transactions.
//!
//! - [`Mempool`]: transactions whose inputs are all known. Indexed by txid,
//!   by spent outpoint (for conflict bookkeeping) and by fee rate (for
//!   lowest-fee-rate eviction).
//! - [`OrphanPool`]: transactions waiting on an unknown parent, indexed by
//!   hash and by the parent txids they wait on.
//! - [`FreeTxLimiter`]: decaying byte budget for transactions that pay less
//!   than the relay fee.
//!
//! Validation happens before insertion; these structures only keep their own
//! indices consistent.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use rand::Rng;
use tracing::debug;

use crate::constants::{DEFAULT_MAX_ORPHAN_TXS, MAX_ORPHAN_TX_SIZE, ORPHAN_TX_EXPIRE_SECS};
use crate::error::MempoolError;
use crate::types::{Block, Hash256, OutPoint, Transaction};
use crate::validation::legacy_sigop_count;

/// Default maximum number of transactions in the pool.
pub const DEFAULT_MAX_COUNT: usize = 5_000;

/// Default maximum total serialized bytes in the pool (5 MiB).
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Fee rate is stored as `fee * FEE_RATE_PRECISION / size`.
const FEE_RATE_PRECISION: u128 = 1_000;

fn compute_fee_rate(fee: u64, size: usize) -> u64 {
    if size == 0 {
        return u64::MAX;
    }
    let rate = u128::from(fee) * FEE_RATE_PRECISION / size as u128;
    u64::try_from(rate).unwrap_or(u64::MAX)
}

/// A pool transaction with precomputed metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    pub fee: u64,
    /// Serialized size in bytes.
    pub size: usize,
    /// Arrival time, unix seconds.
    pub time: u64,
    /// Chain height when the entry was accepted.
    pub height: u32,
    pub sigops: usize,
    fee_rate: u64,
}

impl MempoolEntry {
    pub fn new(tx: Transaction, fee: u64, time: u64, height: u32) -> Self {
        let size = tx.encoded_size();
        Self {
            txid: tx.txid(),
            sigops: legacy_sigop_count(&tx),
            fee_rate: compute_fee_rate(fee, size),
            tx,
            fee,
            size,
            time,
            height,
        }
    }

    /// Fee rate in milli-units per byte.
    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }
}

/// Pool of unconfirmed transactions whose inputs are all known.
#[derive(Debug)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    /// Spent outpoint → txid of the pool transaction spending it.
    spenders: HashMap<OutPoint, Hash256>,
    /// `(fee_rate, txid)`, lowest first.
    by_fee_rate: BTreeSet<(u64, Hash256)>,
    max_count: usize,
    max_bytes: usize,
    total_bytes: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_COUNT, DEFAULT_MAX_BYTES)
    }

    pub fn with_limits(max_count: usize, max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            spenders: HashMap::new(),
            by_fee_rate: BTreeSet::new(),
            max_count,
            max_bytes,
            total_bytes: 0,
        }
    }

    /// Insert an already-validated entry.
    ///
    /// When the pool is full, lowest-fee-rate entries (with their pool
    /// descendants) are evicted as long as the newcomer pays a strictly
    /// higher rate and none of them is one of its pool ancestors. Returns
    /// the evicted entries.
    pub fn add_unchecked(&mut self, entry: MempoolEntry) -> Result<Vec<MempoolEntry>, MempoolError> {
        if self.entries.contains_key(&entry.txid) {
            return Err(MempoolError::AlreadyExists(entry.txid.to_string()));
        }
        for input in &entry.tx.inputs {
            if let Some(existing) = self.spenders.get(&input.previous_output) {
                return Err(MempoolError::Conflict {
                    new_txid: entry.txid.to_string(),
                    existing_txid: existing.to_string(),
                    outpoint: input.previous_output.to_string(),
                });
            }
        }

        let mut evicted = Vec::new();
        let mut ancestors = None;
        while self.entries.len() + 1 > self.max_count || self.total_bytes + entry.size > self.max_bytes {
            let ancestors = ancestors.get_or_insert_with(|| self.pool_ancestors(&entry.tx));
            let next = self
                .by_fee_rate
                .first()
                .filter(|(rate, txid)| entry.fee_rate > *rate && !ancestors.contains(txid))
                .map(|&(_, txid)| txid);
            let Some(lowest) = next else {
                // Put back what this attempt already pushed out.
                for e in evicted.drain(..) {
                    self.insert_entry(e);
                }
                return Err(MempoolError::PoolFull);
            };
            evicted.extend(self.remove_recursive(&lowest));
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), txid = %entry.txid, "evicted low fee-rate pool entries");
        }

        self.insert_entry(entry);
        Ok(evicted)
    }

    /// Pool transactions `tx` depends on, directly or through other pool
    /// transactions.
    fn pool_ancestors(&self, tx: &Transaction) -> HashSet<Hash256> {
        let mut found = HashSet::new();
        let mut queue: VecDeque<Hash256> = tx.inputs.iter().map(|i| i.previous_output.txid).collect();
        while let Some(txid) = queue.pop_front() {
            let Some(parent) = self.entries.get(&txid) else {
                continue;
            };
            if found.insert(txid) {
                queue.extend(parent.tx.inputs.iter().map(|i| i.previous_output.txid));
            }
        }
        found
    }

    fn insert_entry(&mut self, entry: MempoolEntry) {
        for input in &entry.tx.inputs {
            self.spenders.insert(input.previous_output, entry.txid);
        }
        self.by_fee_rate.insert((entry.fee_rate, entry.txid));
        self.total_bytes += entry.size;
        self.entries.insert(entry.txid, entry);
    }

    fn remove_entry(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            self.spenders.remove(&input.previous_output);
        }
        self.by_fee_rate.remove(&(entry.fee_rate, *txid));
        self.total_bytes -= entry.size;
        Some(entry)
    }

    /// Remove a transaction and every pool transaction descending from it.
    pub fn remove_recursive(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let mut removed = Vec::new();
        let mut queue = VecDeque::from([*txid]);
        while let Some(next) = queue.pop_front() {
            let Some(entry) = self.remove_entry(&next) else {
                continue;
            };
            for index in 0..entry.tx.outputs.len() as u32 {
                if let Some(child) = self.spenders.get(&OutPoint::new(next, index)) {
                    queue.push_back(*child);
                }
            }
            removed.push(entry);
        }
        removed
    }

    /// Remove pool transactions that spend any input of `tx`, with descendants.
    pub fn remove_conflicts(&mut self, tx: &Transaction) -> Vec<MempoolEntry> {
        let txid = tx.txid();
        let conflicting: Vec<Hash256> = tx
            .inputs
            .iter()
            .filter_map(|input| self.spenders.get(&input.previous_output).copied())
            .filter(|spender| *spender != txid)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        conflicting
            .iter()
            .flat_map(|c| self.remove_recursive(c))
            .collect()
    }

    /// Drop a connected block's transactions and anything they conflict with.
    ///
    /// Returns `(confirmed, conflicted)`.
    pub fn remove_for_block(&mut self, block: &Block) -> (Vec<MempoolEntry>, Vec<MempoolEntry>) {
        let mut confirmed = Vec::new();
        let mut conflicted = Vec::new();
        for tx in &block.transactions {
            if let Some(entry) = self.remove_entry(&tx.txid()) {
                confirmed.push(entry);
            }
            if !tx.is_coinbase() {
                conflicted.extend(self.remove_conflicts(tx));
            }
        }
        (confirmed, conflicted)
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spenders.get(outpoint).copied()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.entries.get(txid).map(|e| &e.tx)
    }

    pub fn entry(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.spenders.clear();
        self.by_fee_rate.clear();
        self.total_bytes = 0;
    }
}

// --- Orphans ---

#[derive(Debug, Clone)]
pub struct OrphanEntry {
    pub tx: Transaction,
    /// Arrival time, unix seconds.
    pub time: u64,
}

/// Transactions waiting on parents the node has not seen.
#[derive(Debug)]
pub struct OrphanPool {
    by_hash: BTreeMap<Hash256, OrphanEntry>,
    /// Missing parent txid → orphans spending it.
    by_prev: HashMap<Hash256, HashSet<Hash256>>,
    max_orphans: usize,
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ORPHAN_TXS)
    }
}

impl OrphanPool {
    pub fn new(max_orphans: usize) -> Self {
        Self {
            by_hash: BTreeMap::new(),
            by_prev: HashMap::new(),
            max_orphans,
        }
    }

    /// Store an orphan, evicting random entries past the cap.
    ///
    /// Returns false when it was already stored.
    pub fn add(&mut self, tx: Transaction, now: u64) -> Result<bool, MempoolError> {
        self.add_with_rng(tx, now, &mut rand::thread_rng())
    }

    pub fn add_with_rng(
        &mut self,
        tx: Transaction,
        now: u64,
        rng: &mut impl Rng,
    ) -> Result<bool, MempoolError> {
        let size = tx.encoded_size();
        if size > MAX_ORPHAN_TX_SIZE {
            return Err(MempoolError::OrphanTooLarge {
                size,
                max: MAX_ORPHAN_TX_SIZE,
            });
        }
        let txid = tx.txid();
        if self.by_hash.contains_key(&txid) {
            return Ok(false);
        }
        for input in &tx.inputs {
            self.by_prev
                .entry(input.previous_output.txid)
                .or_default()
                .insert(txid);
        }
        self.by_hash.insert(txid, OrphanEntry { tx, time: now });
        self.limit(rng);
        Ok(true)
    }

    /// Evict entries at or after a random hash until within the cap.
    fn limit(&mut self, rng: &mut impl Rng) -> usize {
        let mut evicted = 0;
        while self.by_hash.len() > self.max_orphans {
            let pivot = Hash256(rng.r#gen());
            let victim = self
                .by_hash
                .range(pivot..)
                .next()
                .or_else(|| self.by_hash.iter().next())
                .map(|(txid, _)| *txid);
            let Some(victim) = victim else { break };
            self.remove(&victim);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, "orphan pool over capacity");
        }
        evicted
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let entry = self.by_hash.remove(txid)?;
        for input in &entry.tx.inputs {
            let parent = input.previous_output.txid;
            if let Some(children) = self.by_prev.get_mut(&parent) {
                children.remove(txid);
                if children.is_empty() {
                    self.by_prev.remove(&parent);
                }
            }
        }
        Some(entry.tx)
    }

    /// Orphans spending an output of `parent`, in hash order.
    pub fn children_of(&self, parent: &Hash256) -> Vec<Hash256> {
        let mut children: Vec<Hash256> = self
            .by_prev
            .get(parent)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        children.sort();
        children
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.by_hash.get(txid).map(|e| &e.tx)
    }

    /// Drop orphans older than the expiry window. Returns how many went.
    pub fn expire(&mut self, now: u64) -> usize {
        let stale: Vec<Hash256> = self
            .by_hash
            .iter()
            .filter(|(_, e)| e.time + ORPHAN_TX_EXPIRE_SECS < now)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &stale {
            self.remove(txid);
        }
        stale.len()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.by_hash.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

// --- Free relay ---

/// Seconds over which the free-relay counter decays by a factor of `e`.
const FREE_DECAY_SECS: f64 = 600.0;

/// Rate limiter for transactions paying below the relay fee.
///
/// The byte counter decays by `(1 - 1/600)` per elapsed second; once it
/// reaches `limit_free_relay * 10 * 1000` bytes further free transactions
/// are refused until it decays.
#[derive(Debug, Clone)]
pub struct FreeTxLimiter {
    count: f64,
    last_time: u64,
    limit_free_relay: u64,
}

impl FreeTxLimiter {
    pub fn new(limit_free_relay: u64) -> Self {
        Self {
            count: 0.0,
            last_time: 0,
            limit_free_relay,
        }
    }

    fn threshold(&self) -> f64 {
        (self.limit_free_relay * 10 * 1_000) as f64
    }

    /// Charge `size` bytes at time `now`, or refuse.
    pub fn check(&mut self, size: usize, now: u64) -> Result<(), MempoolError> {
        let elapsed = now.saturating_sub(self.last_time);
        self.count *= (1.0 - 1.0 / FREE_DECAY_SECS).powf(elapsed as f64);
        self.last_time = now;
        if self.count >= self.threshold() {
            return Err(MempoolError::RateLimited);
        }
        self.count += size as f64;
        Ok(())
    }

    pub fn current(&self) -> f64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;
    use crate::types::{TxInput, TxOutput};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    // --- Helpers ---

    fn tx_spending(prevouts: &[OutPoint], outputs: usize, salt: u32) -> Transaction {
        Transaction {
            version: 1,
            time: salt,
            inputs: prevouts.iter().map(|p| TxInput::new(*p, vec![0; 96])).collect(),
            outputs: (0..outputs)
                .map(|_| TxOutput {
                    value: COIN,
                    script_pubkey: vec![0x76; 33],
                })
                .collect(),
            lock_time: 0,
        }
    }

    fn root(seed: u8) -> OutPoint {
        OutPoint::new(Hash256([seed; 32]), 0)
    }

    fn entry(tx: Transaction, fee: u64) -> MempoolEntry {
        MempoolEntry::new(tx, fee, 0, 1)
    }

    // --- Mempool ---

    #[test]
    fn add_and_lookup() {
        let mut pool = Mempool::new();
        let tx = tx_spending(&[root(1)], 1, 0);
        let txid = tx.txid();
        assert!(pool.add_unchecked(entry(tx.clone(), 1_000)).unwrap().is_empty());
        assert!(pool.contains(&txid));
        assert_eq!(pool.get(&txid), Some(&tx));
        assert_eq!(pool.spender_of(&root(1)), Some(txid));
        assert_eq!(pool.total_bytes(), tx.encoded_size());
    }

    #[test]
    fn duplicate_and_conflict_rejected() {
        let mut pool = Mempool::new();
        let a = tx_spending(&[root(1)], 1, 0);
        let b = tx_spending(&[root(1)], 1, 1);
        pool.add_unchecked(entry(a.clone(), 1_000)).unwrap();
        assert!(matches!(
            pool.add_unchecked(entry(a, 1_000)),
            Err(MempoolError::AlreadyExists(_))
        ));
        assert!(matches!(
            pool.add_unchecked(entry(b, 1_000)),
            Err(MempoolError::Conflict { .. })
        ));
    }

    #[test]
    fn remove_recursive_takes_descendants() {
        let mut pool = Mempool::new();
        let parent = tx_spending(&[root(1)], 2, 0);
        let child = tx_spending(&[OutPoint::new(parent.txid(), 0)], 1, 1);
        let grandchild = tx_spending(&[OutPoint::new(child.txid(), 0)], 1, 2);
        let unrelated = tx_spending(&[root(2)], 1, 3);
        for tx in [&parent, &child, &grandchild, &unrelated] {
            pool.add_unchecked(entry(tx.clone(), 1_000)).unwrap();
        }
        let removed = pool.remove_recursive(&parent.txid());
        assert_eq!(removed.len(), 3);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&unrelated.txid()));
        assert!(pool.spender_of(&root(1)).is_none());
    }

    #[test]
    fn remove_for_block_splits_confirmed_and_conflicted() {
        let mut pool = Mempool::new();
        let confirmed = tx_spending(&[root(1)], 1, 0);
        let loser = tx_spending(&[root(2)], 1, 1);
        let loser_child = tx_spending(&[OutPoint::new(loser.txid(), 0)], 1, 2);
        for tx in [&confirmed, &loser, &loser_child] {
            pool.add_unchecked(entry(tx.clone(), 1_000)).unwrap();
        }
        let winner = tx_spending(&[root(2)], 1, 9);
        let block = Block {
            header: crate::types::BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![confirmed.clone(), winner],
            signature: vec![],
        };
        let (done, conflicted) = pool.remove_for_block(&block);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].txid, confirmed.txid());
        assert_eq!(conflicted.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn full_pool_evicts_lowest_fee_rate() {
        let mut pool = Mempool::with_limits(2, usize::MAX);
        let cheap = tx_spending(&[root(1)], 1, 0);
        let mid = tx_spending(&[root(2)], 1, 0);
        let rich = tx_spending(&[root(3)], 1, 0);
        pool.add_unchecked(entry(cheap.clone(), 100)).unwrap();
        pool.add_unchecked(entry(mid, 1_000)).unwrap();

        let evicted = pool.add_unchecked(entry(rich, 10_000)).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].txid, cheap.txid());
        assert_eq!(pool.len(), 2);

        let poor = tx_spending(&[root(4)], 1, 0);
        assert_eq!(pool.add_unchecked(entry(poor, 1)), Err(MempoolError::PoolFull));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn full_pool_keeps_newcomers_parents() {
        let mut pool = Mempool::with_limits(1, usize::MAX);
        let parent = tx_spending(&[root(1)], 1, 0);
        pool.add_unchecked(entry(parent.clone(), 100)).unwrap();

        let child = tx_spending(&[OutPoint::new(parent.txid(), 0)], 1, 1);
        assert_eq!(pool.add_unchecked(entry(child.clone(), 10_000)), Err(MempoolError::PoolFull));
        assert!(pool.contains(&parent.txid()));
        assert!(!pool.contains(&child.txid()));
        assert_eq!(pool.spender_of(&root(1)), Some(parent.txid()));
    }

    #[test]
    fn oversized_newcomer_evicts_nothing() {
        let small = tx_spending(&[root(1)], 1, 0);
        let mut pool = Mempool::with_limits(10, small.encoded_size());
        pool.add_unchecked(entry(small.clone(), 10)).unwrap();

        let big = tx_spending(&[root(2)], 4, 0);
        assert_eq!(pool.add_unchecked(entry(big, 1_000_000)), Err(MempoolError::PoolFull));
        assert!(pool.contains(&small.txid()));
        assert_eq!(pool.total_bytes(), small.encoded_size());
    }

    #[test]
    fn eviction_stopped_by_an_ancestor_restores_the_pool() {
        let cheap = tx_spending(&[root(1)], 1, 0);
        let grandparent = tx_spending(&[root(2)], 1, 0);
        let parent = tx_spending(&[OutPoint::new(grandparent.txid(), 0)], 1, 1);
        let bytes: usize = [&cheap, &grandparent, &parent].iter().map(|tx| tx.encoded_size()).sum();
        let mut pool = Mempool::with_limits(10, bytes);
        pool.add_unchecked(entry(cheap.clone(), 10)).unwrap();
        pool.add_unchecked(entry(grandparent.clone(), 100)).unwrap();
        pool.add_unchecked(entry(parent.clone(), 5_000)).unwrap();

        // Evicting `cheap` frees too little; the grandparent is next in line.
        let big = tx_spending(&[OutPoint::new(parent.txid(), 0)], 4, 2);
        assert!(big.encoded_size() > cheap.encoded_size());
        assert_eq!(pool.add_unchecked(entry(big, 1_000_000)), Err(MempoolError::PoolFull));
        assert_eq!(pool.len(), 3);
        assert!(pool.contains(&cheap.txid()));
        assert_eq!(pool.spender_of(&root(1)), Some(cheap.txid()));
        assert_eq!(pool.total_bytes(), bytes);
    }

    // --- Orphans ---

    #[test]
    fn orphans_indexed_by_missing_parent() {
        let mut orphans = OrphanPool::new(10);
        let parent = Hash256([9; 32]);
        let a = tx_spending(&[OutPoint::new(parent, 0)], 1, 0);
        let b = tx_spending(&[OutPoint::new(parent, 1)], 1, 1);
        assert!(orphans.add(a.clone(), 100).unwrap());
        assert!(!orphans.add(a.clone(), 100).unwrap());
        orphans.add(b.clone(), 100).unwrap();

        let mut expected = vec![a.txid(), b.txid()];
        expected.sort();
        assert_eq!(orphans.children_of(&parent), expected);

        orphans.remove(&a.txid());
        assert_eq!(orphans.children_of(&parent), vec![b.txid()]);
        orphans.remove(&b.txid());
        assert!(orphans.children_of(&parent).is_empty());
    }

    #[test]
    fn oversized_orphan_rejected() {
        let mut orphans = OrphanPool::default();
        let mut tx = tx_spending(&[root(1)], 1, 0);
        tx.inputs[0].script_sig = vec![0; MAX_ORPHAN_TX_SIZE];
        assert!(matches!(orphans.add(tx, 0), Err(MempoolError::OrphanTooLarge { .. })));
    }

    #[test]
    fn orphan_cap_evicts_randomly() {
        let mut orphans = OrphanPool::new(3);
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..10u8 {
            let tx = tx_spending(&[root(i)], 1, u32::from(i));
            orphans.add_with_rng(tx, 0, &mut rng).unwrap();
            assert!(orphans.len() <= 3);
        }
        assert_eq!(orphans.len(), 3);
    }

    #[test]
    fn orphans_expire() {
        let mut orphans = OrphanPool::default();
        orphans.add(tx_spending(&[root(1)], 1, 0), 1_000).unwrap();
        orphans.add(tx_spending(&[root(2)], 1, 0), 2_000).unwrap();
        assert_eq!(orphans.expire(1_000 + ORPHAN_TX_EXPIRE_SECS), 0);
        assert_eq!(orphans.expire(1_001 + ORPHAN_TX_EXPIRE_SECS), 1);
        assert_eq!(orphans.len(), 1);
    }

    // --- Free relay ---

    #[test]
    fn limiter_fills_then_refuses() {
        let mut limiter = FreeTxLimiter::new(1);
        // Threshold is 10_000 bytes.
        for _ in 0..10 {
            limiter.check(1_000, 0).unwrap();
        }
        assert_eq!(limiter.check(1_000, 0), Err(MempoolError::RateLimited));
    }

    #[test]
    fn limiter_decays_over_time() {
        let mut limiter = FreeTxLimiter::new(1);
        for _ in 0..10 {
            limiter.check(1_000, 0).unwrap();
        }
        // About 1/e of the counter is left after ten minutes.
        assert!(limiter.check(1_000, 600).is_ok());
        assert!(limiter.current() < 5_000.0);
    }
}
