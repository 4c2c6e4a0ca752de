//! Layered views over the unspent output set.
//!
//! Every layer implements [`CoinsView`]. A [`CoinsCache`] sits on top of any
//! other view, serves reads from its own map first, and records writes as a
//! dirty delta that [`CoinsCache::flush`] pushes down in one
//! [`CoinsView::batch_write`]. Stacking caches gives cheap throwaway scratch
//! space: the chain state machine connects blocks into a cache layered over
//! the tip cache and simply drops it when a connect fails.
//!
//! Deleted records travel through a batch as `None`.

use std::collections::HashMap;

use crate::coins::{Coins, TxInUndo};
use crate::constants::MEMPOOL_HEIGHT;
use crate::error::FatalError;
use crate::mempool::Mempool;
use crate::types::{Hash256, OutPoint, Transaction};

/// Records to write in one batch; `None` erases.
pub type CoinsDelta = HashMap<Hash256, Option<Coins>>;

/// A readable and batch-writable view of the unspent output set.
pub trait CoinsView {
    /// Look up the record for `txid`. Pruned records read as `None`.
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, FatalError>;

    fn have_coins(&mut self, txid: &Hash256) -> Result<bool, FatalError> {
        Ok(self.get_coins(txid)?.is_some())
    }

    /// Hash of the block whose outputs this view reflects.
    fn best_block(&mut self) -> Result<Hash256, FatalError>;

    /// Apply a delta and move the best block atomically.
    fn batch_write(&mut self, delta: CoinsDelta, best: Hash256) -> Result<(), FatalError>;
}

impl<V: CoinsView + ?Sized> CoinsView for &mut V {
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, FatalError> {
        (**self).get_coins(txid)
    }

    fn have_coins(&mut self, txid: &Hash256) -> Result<bool, FatalError> {
        (**self).have_coins(txid)
    }

    fn best_block(&mut self) -> Result<Hash256, FatalError> {
        (**self).best_block()
    }

    fn batch_write(&mut self, delta: CoinsDelta, best: Hash256) -> Result<(), FatalError> {
        (**self).batch_write(delta, best)
    }
}

impl<V: CoinsView + ?Sized> CoinsView for Box<V> {
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, FatalError> {
        (**self).get_coins(txid)
    }

    fn have_coins(&mut self, txid: &Hash256) -> Result<bool, FatalError> {
        (**self).have_coins(txid)
    }

    fn best_block(&mut self) -> Result<Hash256, FatalError> {
        (**self).best_block()
    }

    fn batch_write(&mut self, delta: CoinsDelta, best: Hash256) -> Result<(), FatalError> {
        (**self).batch_write(delta, best)
    }
}

// --- In-memory backing view ---

/// Backing view held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryCoinsView {
    coins: HashMap<Hash256, Coins>,
    best: Hash256,
    fail_writes: bool,
}

impl MemoryCoinsView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent batch write fail with a storage error.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }
}

impl CoinsView for MemoryCoinsView {
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, FatalError> {
        Ok(self.coins.get(txid).filter(|c| !c.is_pruned()).cloned())
    }

    fn best_block(&mut self) -> Result<Hash256, FatalError> {
        Ok(self.best)
    }

    fn batch_write(&mut self, delta: CoinsDelta, best: Hash256) -> Result<(), FatalError> {
        if self.fail_writes {
            return Err(FatalError::Storage("injected write failure".into()));
        }
        for (txid, coins) in delta {
            match coins {
                Some(coins) if !coins.is_pruned() => {
                    self.coins.insert(txid, coins);
                }
                _ => {
                    self.coins.remove(&txid);
                }
            }
        }
        self.best = best;
        Ok(())
    }
}

// --- Cache ---

#[derive(Debug, Clone)]
struct CacheEntry {
    coins: Option<Coins>,
    dirty: bool,
}

/// Write-back cache layered over another view.
#[derive(Debug)]
pub struct CoinsCache<V> {
    base: V,
    entries: HashMap<Hash256, CacheEntry>,
    best: Option<Hash256>,
}

impl<V: CoinsView> CoinsCache<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            entries: HashMap::new(),
            best: None,
        }
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut V {
        &mut self.base
    }

    fn fetch(&mut self, txid: &Hash256) -> Result<&mut CacheEntry, FatalError> {
        if !self.entries.contains_key(txid) {
            let coins = self.base.get_coins(txid)?;
            self.entries.insert(*txid, CacheEntry { coins, dirty: false });
        }
        self.entries
            .get_mut(txid)
            .ok_or_else(|| FatalError::Corruption(format!("cache entry vanished for {txid}")))
    }

    /// Borrow a record without cloning it.
    pub fn access_coins(&mut self, txid: &Hash256) -> Result<Option<&Coins>, FatalError> {
        let entry = self.fetch(txid)?;
        Ok(entry.coins.as_ref().filter(|c| !c.is_pruned()))
    }

    /// Mutable access to a record slot, marking it dirty.
    pub fn modify(&mut self, txid: &Hash256) -> Result<&mut Option<Coins>, FatalError> {
        let entry = self.fetch(txid)?;
        entry.dirty = true;
        Ok(&mut entry.coins)
    }

    pub fn set_coins(&mut self, txid: Hash256, coins: Option<Coins>) {
        self.entries.insert(txid, CacheEntry { coins, dirty: true });
    }

    /// Spend one output, returning its undo record.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<Option<TxInUndo>, FatalError> {
        let slot = self.modify(&outpoint.txid)?;
        let Some(coins) = slot.as_mut() else {
            return Ok(None);
        };
        let undo = coins.spend(outpoint.index);
        if coins.is_pruned() {
            *slot = None;
        }
        Ok(undo)
    }

    /// Whether an output exists and is unspent.
    pub fn have_output(&mut self, outpoint: &OutPoint) -> Result<bool, FatalError> {
        Ok(self
            .access_coins(&outpoint.txid)?
            .is_some_and(|c| c.is_available(outpoint.index)))
    }

    /// Add a confirmed transaction's outputs at `height`.
    pub fn add_tx_outputs(&mut self, tx: &Transaction, height: u32) {
        let coins = Coins::from_tx(tx, height);
        self.set_coins(tx.txid(), (!coins.is_pruned()).then_some(coins));
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best = Some(hash);
    }

    /// Push all dirty records to the base view and empty the cache.
    ///
    /// On failure the cache is left exactly as it was.
    pub fn flush(&mut self) -> Result<(), FatalError> {
        let best = self.best_block()?;
        let delta: CoinsDelta = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(txid, e)| (*txid, e.coins.clone()))
            .collect();
        self.base.batch_write(delta, best)?;
        self.entries.clear();
        self.best = None;
        Ok(())
    }

    /// Drop a clean record from memory.
    pub fn uncache(&mut self, txid: &Hash256) {
        if self.entries.get(txid).is_some_and(|e| !e.dirty) {
            self.entries.remove(txid);
        }
    }

    pub fn cache_size(&self) -> usize {
        self.entries.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|e| e.dirty).count()
    }

    /// Approximate memory held by cached records.
    pub fn dynamic_usage(&self) -> usize {
        self.entries
            .values()
            .map(|e| {
                std::mem::size_of::<(Hash256, CacheEntry)>()
                    + e.coins.as_ref().map_or(0, Coins::dynamic_usage)
            })
            .sum()
    }

    /// Value of an unspent output, if present.
    pub fn output_value(&mut self, outpoint: &OutPoint) -> Result<Option<u64>, FatalError> {
        Ok(self
            .access_coins(&outpoint.txid)?
            .and_then(|c| c.output(outpoint.index))
            .map(|o| o.value))
    }

    /// Consume the cache, discarding unflushed changes, and return the base.
    pub fn into_base(self) -> V {
        self.base
    }
}

impl<V: CoinsView> CoinsView for CoinsCache<V> {
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, FatalError> {
        Ok(self.access_coins(txid)?.cloned())
    }

    fn best_block(&mut self) -> Result<Hash256, FatalError> {
        match self.best {
            Some(best) => Ok(best),
            None => self.base.best_block(),
        }
    }

    fn batch_write(&mut self, delta: CoinsDelta, best: Hash256) -> Result<(), FatalError> {
        for (txid, coins) in delta {
            self.entries.insert(txid, CacheEntry { coins, dirty: true });
        }
        self.best = Some(best);
        Ok(())
    }
}

// --- Pool overlay ---

/// Read-only view that also sees outputs of unconfirmed pool transactions.
///
/// Pool outputs appear at [`MEMPOOL_HEIGHT`]. Which pool outputs are already
/// spent by other pool transactions is the pool's concern, not this view's.
pub struct MempoolCoinsView<'a, V> {
    base: V,
    pool: &'a Mempool,
}

impl<'a, V: CoinsView> MempoolCoinsView<'a, V> {
    pub fn new(base: V, pool: &'a Mempool) -> Self {
        Self { base, pool }
    }
}

impl<V: CoinsView> CoinsView for MempoolCoinsView<'_, V> {
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, FatalError> {
        if let Some(coins) = self.base.get_coins(txid)? {
            return Ok(Some(coins));
        }
        Ok(self.pool.get(txid).map(|tx| Coins::from_tx(tx, MEMPOOL_HEIGHT)))
    }

    fn best_block(&mut self) -> Result<Hash256, FatalError> {
        self.base.best_block()
    }

    fn batch_write(&mut self, _delta: CoinsDelta, _best: Hash256) -> Result<(), FatalError> {
        Err(FatalError::ReadOnlyView)
    }
}
