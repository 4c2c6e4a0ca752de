//! The chain state machine.
//!
//! [`Chainstate`] owns the block index, the tip UTXO cache, the block and
//! undo stores, the transaction pool and both orphan pools. Every mutation
//! goes through `&mut self`; the node wraps the whole value in one lock.
//!
//! Blocks move through three stages:
//!
//! 1. **Accept** (`process_block`): context-free and contextual checks, body
//!    written to the block store, index entry persisted.
//! 2. **Select** (`activate_best_chain`): the candidate with the most trust
//!    whose ancestors all have bodies and none failed.
//! 3. **Switch** (`try_switch_to`): disconnect back to the fork, connect the
//!    new branch into a throwaway cache layered on the tip cache, and commit
//!    only if every block connects. A failing block is marked invalid and the
//!    tip does not move.
//!
//! Any storage failure is fatal: the error is returned and every later
//! mutating call is refused with [`FatalError::Halted`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use strata_core::block_validation::{self, BlockContext};
use strata_core::coins::{BlockUndo, Coins};
use strata_core::constants::{DEFAULT_LIMIT_FREE_RELAY, DEFAULT_MAX_ORPHAN_TXS, MAX_ORPHAN_BLOCKS};
use strata_core::error::{BlockError, FatalError, StrataError};
use strata_core::genesis;
use strata_core::kernel::{self, StakeInput};
use strata_core::mempool::{FreeTxLimiter, Mempool, OrphanPool};
use strata_core::params::ChainParams;
use strata_core::store::{MemoryFlatStore, MemoryIndexStore};
use strata_core::traits::{ConsensusHooks, DiskPos, FlatStore, IndexMetaKey, IndexStore, NoopHooks};
use strata_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxOutput};
use strata_core::view::{CoinsCache, CoinsView, MemoryCoinsView};

use crate::block_index::{BlockId, BlockIndex, BlockIndexEntry, Validity};
use crate::checkpoint;
use crate::connect::{self, ConnectContext, ConnectedBlock};
use crate::events::{ChainEvent, ChainListener};
use crate::sigcheck::SigVerifier;

/// The tip cache sits directly on the persistent coins store.
pub type TipCache = CoinsCache<Box<dyn CoinsView + Send>>;

/// Tunables of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainstateConfig {
    /// Flush the tip cache to the coins store once it grows past this.
    pub coins_cache_bytes: usize,
    /// Signature verification workers. Zero verifies inline.
    pub script_threads: usize,
    pub max_orphan_blocks: usize,
    pub max_orphan_txs: usize,
    pub max_mempool_txs: usize,
    pub max_mempool_bytes: usize,
    /// Thousands of bytes per minute of free transactions to relay.
    pub limit_free_relay: u64,
}

impl Default for ChainstateConfig {
    fn default() -> Self {
        Self {
            coins_cache_bytes: 64 * 1024 * 1024,
            script_threads: 0,
            max_orphan_blocks: MAX_ORPHAN_BLOCKS,
            max_orphan_txs: DEFAULT_MAX_ORPHAN_TXS,
            max_mempool_txs: 50_000,
            max_mempool_bytes: 300 * 1024 * 1024,
            limit_free_relay: DEFAULT_LIMIT_FREE_RELAY,
        }
    }
}

/// Persistent backends of a chain state.
pub struct ChainStores {
    pub coins: Box<dyn CoinsView + Send>,
    pub blocks: Box<dyn FlatStore>,
    pub undo: Box<dyn FlatStore>,
    pub index: Box<dyn IndexStore>,
}

impl ChainStores {
    /// Stores that live only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            coins: Box::new(MemoryCoinsView::new()),
            blocks: Box::new(MemoryFlatStore::new()),
            undo: Box::new(MemoryFlatStore::new()),
            index: Box::new(MemoryIndexStore::new()),
        }
    }
}

/// Result of handing a block to [`Chainstate::process_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored and offered to chain selection.
    Accepted { hash: Hash256, height: u32 },
    /// Already stored, or already waiting for its parent.
    Duplicate { hash: Hash256 },
}

enum SwitchOutcome {
    Switched,
    Invalid { hash: Hash256, error: StrataError },
}

/// Blocks whose parent is unknown, keyed by hash and by missing parent.
#[derive(Debug, Default)]
struct OrphanBlocks {
    blocks: HashMap<Hash256, Block>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    order: VecDeque<Hash256>,
    max: usize,
}

impl OrphanBlocks {
    fn new(max: usize) -> Self {
        Self { max, ..Self::default() }
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    fn insert(&mut self, hash: Hash256, block: Block) {
        if self.blocks.contains_key(&hash) {
            return;
        }
        self.by_prev.entry(block.header.prev_hash).or_default().push(hash);
        self.blocks.insert(hash, block);
        self.order.push_back(hash);
        while self.blocks.len() > self.max {
            let Some(oldest) = self.order.pop_front() else { break };
            self.remove(&oldest);
        }
    }

    fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let block = self.blocks.remove(hash)?;
        let prev = block.header.prev_hash;
        if let Some(waiting) = self.by_prev.get_mut(&prev) {
            waiting.retain(|h| h != hash);
            if waiting.is_empty() {
                self.by_prev.remove(&prev);
            }
        }
        Some(block)
    }

    /// Remove and return every block waiting on `parent`, in arrival order.
    fn take_children(&mut self, parent: &Hash256) -> Vec<Block> {
        let hashes = self.by_prev.remove(parent).unwrap_or_default();
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(block) = self.blocks.remove(&hash) {
                self.order.retain(|h| *h != hash);
                out.push(block);
            }
        }
        out
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }
}

fn system_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn encode_block(block: &Block) -> Result<Vec<u8>, FatalError> {
    bincode::encode_to_vec(block, bincode::config::standard())
        .map_err(|e| FatalError::Storage(format!("encode block: {e}")))
}

fn read_block(store: &dyn FlatStore, entry: &BlockIndexEntry) -> Result<Block, FatalError> {
    let pos = entry
        .block_pos
        .ok_or_else(|| FatalError::MissingBlockData(entry.hash.to_string()))?;
    let bytes = store.read(&pos)?;
    let (block, _): (Block, usize) = bincode::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| FatalError::Corruption(format!("block {}: {e}", entry.hash)))?;
    if block.hash() != entry.hash {
        return Err(FatalError::Corruption(format!("block store returned wrong block for {}", entry.hash)));
    }
    Ok(block)
}

fn read_undo(store: &dyn FlatStore, entry: &BlockIndexEntry) -> Result<BlockUndo, FatalError> {
    let pos = entry
        .undo_pos
        .ok_or_else(|| FatalError::MissingUndo(entry.hash.to_string()))?;
    let bytes = store.read(&pos)?;
    BlockUndo::decode(&bytes).map_err(|e| FatalError::Corruption(format!("undo {}: {e}", entry.hash)))
}

/// Write every dirty index entry plus the meta records in one batch.
fn persist_index(index: &mut BlockIndex, store: &mut dyn IndexStore, last_file: u32) -> Result<(), FatalError> {
    if !index.has_dirty() {
        return Ok(());
    }
    let entries = index.take_dirty();
    let meta = vec![
        (IndexMetaKey::LastFile, last_file.to_le_bytes().to_vec()),
        (IndexMetaKey::BestInvalidTrust, index.best_invalid_trust().to_string().into_bytes()),
    ];
    if let Err(e) = store.write_batch(&entries, &meta) {
        index.mark_dirty(entries.iter().map(|e| e.hash));
        return Err(e);
    }
    Ok(())
}

/// Contextual facts for a block at `height` with the given hash on top of `prev`.
fn block_context(
    index: &BlockIndex,
    prev: BlockId,
    hash: &Hash256,
    is_pos: bool,
    adjusted_time: u64,
    params: &ChainParams,
) -> BlockContext {
    let height = index.get(prev).height + 1;
    BlockContext {
        height,
        expected_bits: index.next_work_required(prev, is_pos, params),
        median_time_past: index.median_time_past(prev),
        adjusted_time,
        known_checkpoint_height: checkpoint_guard(index, height, hash, params),
    }
}

/// The highest indexed checkpoint this block would fork below, if any.
///
/// A block that is itself an ancestor of that checkpoint does not fork.
fn checkpoint_guard(index: &BlockIndex, height: u32, hash: &Hash256, params: &ChainParams) -> Option<u32> {
    let known = index.known_checkpoint_height(params)?;
    if height >= known {
        return Some(known);
    }
    let (_, cp_hash) = params.checkpoints.iter().find(|(h, _)| *h == known)?;
    let cp = index.lookup(cp_hash)?;
    match index.ancestor(cp, height) {
        Some(a) if index.get(a).hash == *hash => None,
        _ => Some(known),
    }
}

pub struct Chainstate {
    pub(crate) params: ChainParams,
    pub(crate) config: ChainstateConfig,
    pub(crate) index: BlockIndex,
    pub(crate) tip: TipCache,
    blocks: Box<dyn FlatStore>,
    undo: Box<dyn FlatStore>,
    index_store: Box<dyn IndexStore>,
    last_block_file: u32,
    pub(crate) hooks: Arc<dyn ConsensusHooks>,
    pub(crate) mempool: Mempool,
    pub(crate) orphan_txs: OrphanPool,
    orphan_blocks: OrphanBlocks,
    pub(crate) free_limiter: FreeTxLimiter,
    verifier: SigVerifier,
    listeners: Vec<Box<dyn ChainListener>>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
    halted: Option<String>,
}

impl std::fmt::Debug for Chainstate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chainstate")
            .field("network", &self.params.network)
            .field("height", &self.height())
            .field("mempool", &self.mempool.len())
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

impl Chainstate {
    /// Open a chain state over `stores`, creating the genesis block when the
    /// stores are empty. Uses the system clock.
    pub fn open(
        params: ChainParams,
        config: ChainstateConfig,
        stores: ChainStores,
        hooks: Arc<dyn ConsensusHooks>,
    ) -> Result<Self, StrataError> {
        Self::open_with_clock(params, config, stores, hooks, system_time)
    }

    /// In-memory chain state with default hooks, for tests and tools.
    pub fn in_memory(params: ChainParams, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Result<Self, StrataError> {
        Self::open_with_clock(
            params,
            ChainstateConfig::default(),
            ChainStores::in_memory(),
            Arc::new(NoopHooks),
            clock,
        )
    }

    /// [`Chainstate::open`] with a custom clock.
    pub fn open_with_clock(
        params: ChainParams,
        config: ChainstateConfig,
        stores: ChainStores,
        hooks: Arc<dyn ConsensusHooks>,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Result<Self, StrataError> {
        let ChainStores {
            coins,
            blocks,
            undo,
            index: index_store,
        } = stores;
        let mut tip = CoinsCache::new(coins);
        let best = tip.best_block()?;
        let stored = index_store.load_all()?;
        let fresh = stored.is_empty();
        let index = if fresh {
            if !best.is_zero() {
                return Err(FatalError::Corruption(format!(
                    "coins store is at {best} but the block index is empty"
                ))
                .into());
            }
            BlockIndex::new()
        } else {
            BlockIndex::load(stored, &best, &params)?
        };

        let mut chainstate = Self {
            mempool: Mempool::with_limits(config.max_mempool_txs, config.max_mempool_bytes),
            orphan_txs: OrphanPool::new(config.max_orphan_txs),
            orphan_blocks: OrphanBlocks::new(config.max_orphan_blocks),
            free_limiter: FreeTxLimiter::new(config.limit_free_relay),
            verifier: SigVerifier::new(config.script_threads),
            params,
            config,
            index,
            tip,
            blocks,
            undo,
            index_store,
            last_block_file: 0,
            hooks,
            listeners: Vec::new(),
            clock: Box::new(clock),
            halted: None,
        };

        if fresh {
            chainstate.init_genesis()?;
        } else {
            let rejected = chainstate.activate_best_chain()?;
            for (hash, error) in rejected {
                warn!(%hash, %error, "stored block failed to connect on startup");
            }
        }
        if let Some(tip) = chainstate.index.tip_entry() {
            info!(
                network = ?chainstate.params.network,
                height = tip.height,
                hash = %tip.hash,
                blocks = chainstate.index.len(),
                "chain state opened"
            );
        }
        Ok(chainstate)
    }

    fn init_genesis(&mut self) -> Result<(), StrataError> {
        let block = genesis::genesis_block(&self.params);
        let hash = block.hash();
        let id = self
            .index
            .insert_header(&block.header, &self.params)
            .map_err(|e| FatalError::Corruption(format!("genesis header: {e}")))?;
        let pos = self.blocks.write(&encode_block(&block)?)?;
        self.last_block_file = pos.file;
        self.index.received_body(id, 1, pos, None);

        let mut supply = 0u64;
        for tx in &block.transactions {
            self.tip.add_tx_outputs(tx, 0);
            supply = supply.saturating_add(tx.total_output_value().unwrap_or(0));
        }
        self.tip.set_best_block(hash);
        self.index.set_connect_results(id, supply, supply, hash);
        self.index.raise_validity(id, Validity::Scripts);
        self.index.set_tip(id);

        self.blocks.flush()?;
        persist_index(&mut self.index, &mut *self.index_store, self.last_block_file)?;
        self.tip.flush()?;
        info!(%hash, "initialized chain with genesis block");
        Ok(())
    }

    // --- Accessors ---

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &ChainstateConfig {
        &self.config
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn orphan_tx_count(&self) -> usize {
        self.orphan_txs.len()
    }

    pub fn orphan_block_count(&self) -> usize {
        self.orphan_blocks.len()
    }

    pub fn tip_entry(&self) -> Option<&BlockIndexEntry> {
        self.index.tip_entry()
    }

    /// Height of the active tip.
    pub fn height(&self) -> u32 {
        self.index.chain().height().unwrap_or(0)
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.index.tip_entry().map_or(Hash256::ZERO, |e| e.hash)
    }

    /// Money supply as of the active tip.
    pub fn money_supply(&self) -> u64 {
        self.index.tip_entry().map_or(0, |e| e.money_supply)
    }

    pub fn locator(&self) -> Vec<Hash256> {
        self.index.tip().map(|t| self.index.locator(t)).unwrap_or_default()
    }

    /// Network-adjusted clock in seconds.
    pub fn adjusted_time(&self) -> u64 {
        (self.clock)()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Bits required for the next block of the given type on the tip.
    pub fn next_work_required(&self, is_pos: bool) -> u32 {
        match self.index.tip() {
            Some(tip) => self.index.next_work_required(tip, is_pos, &self.params),
            None => strata_core::difficulty::target_limit(is_pos, &self.params),
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn ChainListener>) {
        self.listeners.push(listener);
    }

    /// Unspent output at `outpoint` as of the active tip.
    pub fn utxo(&mut self, outpoint: &OutPoint) -> Result<Option<TxOutput>, StrataError> {
        Ok(self
            .tip
            .access_coins(&outpoint.txid)?
            .and_then(|c| c.output(outpoint.index))
            .cloned())
    }

    /// Unspent record of `txid` as of the active tip.
    pub fn coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, StrataError> {
        Ok(self.tip.access_coins(txid)?.cloned())
    }

    /// Read a stored block by hash.
    pub fn block(&self, hash: &Hash256) -> Result<Option<Block>, StrataError> {
        match self.index.lookup_entry(hash) {
            Some(entry) if entry.status.has_data() => Ok(Some(read_block(&*self.blocks, entry)?)),
            _ => Ok(None),
        }
    }

    pub(crate) fn emit(&self, event: ChainEvent) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<(), StrataError> {
        match &self.halted {
            Some(reason) => Err(FatalError::Halted(reason.clone()).into()),
            None => Ok(()),
        }
    }

    /// Latch the halt flag on a fatal result.
    pub(crate) fn check_fatal<T>(&mut self, result: Result<T, StrataError>) -> Result<T, StrataError> {
        if let Err(StrataError::Fatal(e)) = &result {
            if self.halted.is_none() && !matches!(e, FatalError::Halted(_)) {
                error!(error = %e, "fatal chain state error, refusing further mutations");
                self.halted = Some(e.to_string());
            }
        }
        result
    }

    // --- Headers and blocks ---

    /// Index a header without its body.
    pub fn process_header(&mut self, header: &BlockHeader) -> Result<(), StrataError> {
        self.ensure_live()?;
        let result = self.process_header_inner(header);
        self.check_fatal(result)
    }

    fn process_header_inner(&mut self, header: &BlockHeader) -> Result<(), StrataError> {
        let hash = header.hash();
        if let Some(entry) = self.index.lookup_entry(&hash) {
            if entry.status.is_failed() {
                return Err(BlockError::KnownInvalid(hash.to_string()).into());
            }
            return Ok(());
        }
        let prev = self
            .index
            .lookup(&header.prev_hash)
            .ok_or_else(|| BlockError::OrphanBlock(header.prev_hash.to_string()))?;
        if self.index.get(prev).status.is_failed() {
            return Err(BlockError::PrevInvalid(header.prev_hash.to_string()).into());
        }
        let height = self.index.get(prev).height + 1;
        let ctx = BlockContext {
            height,
            expected_bits: header.bits,
            median_time_past: self.index.median_time_past(prev),
            adjusted_time: self.adjusted_time(),
            known_checkpoint_height: checkpoint_guard(&self.index, height, &hash, &self.params),
        };
        if let Err(e) = block_validation::check_header_contextual(header, &ctx, &self.params) {
            return Err(self.reject_header(header, e));
        }
        self.index.insert_header(header, &self.params)?;
        persist_index(&mut self.index, &mut *self.index_store, self.last_block_file)?;
        Ok(())
    }

    /// Remember a header as invalid when the failure is permanent.
    fn reject_header(&mut self, header: &BlockHeader, err: BlockError) -> StrataError {
        if err.marks_failed() {
            if let Ok(id) = self.index.insert_header(header, &self.params) {
                self.index.mark_failed(id);
            }
        }
        debug!(hash = %header.hash(), error = %err, "rejected block");
        err.into()
    }

    /// Validate, store and try to activate a block.
    ///
    /// An unknown parent parks the block in the orphan pool and returns
    /// [`BlockError::OrphanBlock`]. Blocks waiting on this one are processed
    /// after it.
    pub fn process_block(&mut self, block: Block) -> Result<BlockOutcome, StrataError> {
        self.ensure_live()?;
        let result = self.process_block_inner(block);
        self.check_fatal(result)
    }

    fn process_block_inner(&mut self, block: Block) -> Result<BlockOutcome, StrataError> {
        let hash = block.hash();
        if let Some(entry) = self.index.lookup_entry(&hash) {
            if entry.status.is_failed() {
                return Err(BlockError::KnownInvalid(hash.to_string()).into());
            }
            if entry.status.has_data() {
                return Ok(BlockOutcome::Duplicate { hash });
            }
        }
        if self.orphan_blocks.contains(&hash) {
            return Ok(BlockOutcome::Duplicate { hash });
        }

        block_validation::check_block(&block, &self.params, true)?;

        let prev_hash = block.header.prev_hash;
        if self.index.lookup(&prev_hash).is_none() {
            debug!(%hash, prev = %prev_hash, "block parent unknown, holding as orphan");
            self.orphan_blocks.insert(hash, block);
            return Err(BlockError::OrphanBlock(prev_hash.to_string()).into());
        }

        let id = self.accept_block(&block)?;
        let height = self.index.get(id).height;
        let mut rejected = self.activate_inner()?;

        let mut queue = VecDeque::from([hash]);
        while let Some(parent) = queue.pop_front() {
            for child in self.orphan_blocks.take_children(&parent) {
                let child_hash = child.hash();
                match self.accept_block(&child) {
                    Ok(_) => {
                        rejected.extend(self.activate_inner()?);
                        queue.push_back(child_hash);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => debug!(hash = %child_hash, error = %e, "orphan block rejected"),
                }
            }
        }

        let mut failed_ancestor = None;
        for (failed, error) in rejected {
            if failed == hash {
                return Err(error);
            }
            if failed_ancestor.is_none() && self.is_ancestor(&failed, id) {
                failed_ancestor = Some(failed);
            }
        }
        if let Some(failed) = failed_ancestor {
            debug!(%hash, ancestor = %failed, "block sits on an ancestor that failed to connect");
            return Err(BlockError::PrevInvalid(failed.to_string()).into());
        }
        Ok(BlockOutcome::Accepted { hash, height })
    }

    /// Whether `hash` is a strict ancestor of `id`.
    fn is_ancestor(&self, hash: &Hash256, id: BlockId) -> bool {
        let Some(other) = self.index.lookup(hash) else { return false };
        let height = self.index.get(other).height;
        height < self.index.get(id).height && self.index.ancestor(id, height) == Some(other)
    }

    /// Contextual checks, store the body and record it in the index.
    fn accept_block(&mut self, block: &Block) -> Result<BlockId, StrataError> {
        let hash = block.hash();
        let prev = self
            .index
            .lookup(&block.header.prev_hash)
            .ok_or_else(|| BlockError::OrphanBlock(block.header.prev_hash.to_string()))?;
        if self.index.get(prev).status.is_failed() {
            return Err(self.reject_header(&block.header, BlockError::PrevInvalid(block.header.prev_hash.to_string())));
        }

        let ctx = block_context(
            &self.index,
            prev,
            &hash,
            block.is_proof_of_stake(),
            self.adjusted_time(),
            &self.params,
        );
        if let Err(e) = block_validation::check_block_contextual(block, &ctx, &self.params) {
            return Err(self.reject_header(&block.header, e));
        }

        if let Some(stake) = block.proof_of_stake() {
            if self.index.is_stake_seen(&stake) {
                return Err(BlockError::DuplicateStake(format!("{}:{}", stake.0.txid, stake.0.index)).into());
            }
            if Some(prev) == self.index.tip() {
                self.check_kernel_on_tip(block, prev, ctx.expected_bits)?;
            }
        }

        let id = self.index.insert_header(&block.header, &self.params)?;
        let pos: DiskPos = self.blocks.write(&encode_block(block)?)?;
        self.last_block_file = pos.file;
        self.index.received_body(id, block.transactions.len() as u32, pos, block.proof_of_stake());
        persist_index(&mut self.index, &mut *self.index_store, self.last_block_file)?;
        debug!(height = ctx.height, %hash, pos = pos.offset, "stored block");
        Ok(id)
    }

    /// Early kernel check for a stake block built directly on the tip.
    fn check_kernel_on_tip(&mut self, block: &Block, prev: BlockId, bits: u32) -> Result<(), StrataError> {
        let Some(coinstake) = block.coinstake() else { return Ok(()) };
        let prevout = coinstake.inputs[0].previous_output;
        let found = self
            .tip
            .access_coins(&prevout.txid)?
            .and_then(|c| c.output(prevout.index).map(|o| (o.value, c.time)));
        let result = match found {
            Some((value, coin_time)) => kernel::check_stake_kernel(
                bits,
                self.index.get(prev).stake_modifier,
                &StakeInput { prevout, value, coin_time },
                coinstake.time,
                &self.params,
            )
            .map(|_| ()),
            None => Err(BlockError::StakeInputMissing(prevout.to_string())),
        };
        result.map_err(|e| self.reject_header(&block.header, e))
    }

    // --- Chain selection ---

    /// Switch to the best valid candidate until the tip is the best.
    ///
    /// Returns the blocks found invalid on the way.
    pub fn activate_best_chain(&mut self) -> Result<Vec<(Hash256, StrataError)>, StrataError> {
        self.ensure_live()?;
        let result = self.activate_inner();
        self.check_fatal(result)
    }

    fn activate_inner(&mut self) -> Result<Vec<(Hash256, StrataError)>, StrataError> {
        let mut rejected = Vec::new();
        loop {
            let Some(best) = self.index.find_best_candidate() else { break };
            let Some(tip) = self.index.tip() else { break };
            if best == tip || self.index.get(best).trust < self.index.get(tip).trust {
                break;
            }
            match self.try_switch_to(best)? {
                SwitchOutcome::Switched => {}
                SwitchOutcome::Invalid { hash, error } => {
                    rejected.push((hash, error));
                    self.index.rebuild_candidates();
                }
            }
        }
        self.index.prune_candidates();
        Ok(rejected)
    }

    /// Make `target` the tip, or mark the first block that fails to connect.
    fn try_switch_to(&mut self, target: BlockId) -> Result<SwitchOutcome, StrataError> {
        let tip = self
            .index
            .tip()
            .ok_or_else(|| FatalError::Corruption("no active tip".into()))?;
        let fork = self
            .index
            .last_common_ancestor(tip, target)
            .ok_or_else(|| FatalError::Corruption("candidate does not share genesis".into()))?;
        let fork_height = self.index.get(fork).height;

        let mut disconnect = Vec::new();
        let mut walk = tip;
        while walk != fork {
            disconnect.push(walk);
            walk = self
                .index
                .get(walk)
                .prev
                .ok_or_else(|| FatalError::Corruption("active chain broken".into()))?;
        }
        let mut connect = Vec::new();
        let mut walk = target;
        while walk != fork {
            connect.push(walk);
            walk = self
                .index
                .get(walk)
                .prev
                .ok_or_else(|| FatalError::Corruption("candidate chain broken".into()))?;
        }
        connect.reverse();

        if !disconnect.is_empty() && checkpoint::is_below_checkpoint(&self.params, fork_height + 1) {
            let hash = self.index.get(target).hash;
            if let Some(first) = connect.first() {
                self.index.mark_failed(*first);
                persist_index(&mut self.index, &mut *self.index_store, self.last_block_file)?;
            }
            let error = BlockError::ForkBelowCheckpoint {
                height: fork_height + 1,
                checkpoint: self.params.last_checkpoint_height(),
            };
            warn!(%hash, fork_height, "refusing reorganization below checkpoint");
            return Ok(SwitchOutcome::Invalid { hash, error: error.into() });
        }

        let adjusted_time = self.adjusted_time();
        let mut scratch = CoinsCache::new(&mut self.tip);
        let mut resurrect: Vec<Vec<Transaction>> = Vec::new();

        for id in &disconnect {
            let entry = self.index.get(*id);
            let block = read_block(&*self.blocks, entry)?;
            let undo = read_undo(&*self.undo, entry)?;
            connect::disconnect_block(&block, &undo, &mut scratch)?;
            resurrect.push(
                block
                    .transactions
                    .into_iter()
                    .filter(|tx| !tx.is_coinbase() && !tx.is_coinstake())
                    .collect(),
            );
        }

        let mut supply = self.index.get(fork).money_supply;
        let mut connected: Vec<(BlockId, Block, ConnectedBlock, u64)> = Vec::with_capacity(connect.len());
        for id in &connect {
            let entry = self.index.get(*id);
            let prev = entry
                .prev
                .ok_or_else(|| FatalError::Corruption("connect without parent".into()))?;
            let block = read_block(&*self.blocks, entry)?;
            let ctx = block_context(
                &self.index,
                prev,
                &entry.hash,
                block.is_proof_of_stake(),
                adjusted_time,
                &self.params,
            );
            let connect_ctx = ConnectContext {
                height: entry.height,
                stake_modifier: self.index.get(prev).stake_modifier,
                verify_scripts: checkpoint::should_verify_scripts(&self.params, entry.height),
            };
            let result = block_validation::check_block_contextual(&block, &ctx, &self.params)
                .map_err(StrataError::from)
                .and_then(|()| {
                    connect::connect_block(
                        &block,
                        &connect_ctx,
                        &mut scratch,
                        &self.verifier,
                        &*self.hooks,
                        &self.params,
                    )
                })
                .and_then(|c| {
                    let next = i128::from(supply) + i128::from(c.value_out) - i128::from(c.value_in);
                    match u64::try_from(next) {
                        Ok(next) => Ok((c, next)),
                        Err(_) => Err(BlockError::SupplyOutOfRange.into()),
                    }
                });
            match result {
                Ok((c, next)) => {
                    supply = next;
                    connected.push((*id, block, c, next));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(error) => {
                    drop(scratch);
                    let (hash, height) = (entry.hash, entry.height);
                    warn!(height, %hash, %error, "block failed to connect");
                    self.index.mark_failed(*id);
                    persist_index(&mut self.index, &mut *self.index_store, self.last_block_file)?;
                    return Ok(SwitchOutcome::Invalid { hash, error });
                }
            }
        }

        for (id, _, c, supply) in &connected {
            let bytes = c
                .undo
                .encode()
                .map_err(|e| FatalError::Storage(format!("encode undo: {e}")))?;
            let pos = self.undo.write(&bytes)?;
            self.index.set_undo_pos(*id, pos);
            self.index.set_connect_results(*id, *supply, c.mint(), c.proof_hash);
            self.index.raise_validity(*id, Validity::Scripts);
        }
        self.undo.flush()?;
        persist_index(&mut self.index, &mut *self.index_store, self.last_block_file)?;
        scratch.flush()?;
        drop(scratch);
        if self.tip.dynamic_usage() > self.config.coins_cache_bytes {
            debug!(usage = self.tip.dynamic_usage(), "flushing coins cache");
            self.tip.flush()?;
        }
        self.index.set_tip(target);

        let (height, hash) = {
            let entry = self.index.get(target);
            (entry.height, entry.hash)
        };
        if disconnect.is_empty() {
            debug!(height, %hash, connected = connected.len(), "extended active chain");
        } else {
            info!(
                height,
                %hash,
                fork_height,
                disconnected = disconnect.len(),
                connected = connected.len(),
                "reorganized active chain"
            );
        }

        for (id, block, _, _) in &connected {
            let block_height = self.index.get(*id).height;
            let (_, conflicted) = self.mempool.remove_for_block(block);
            for tx in &block.transactions {
                self.emit(ChainEvent::TransactionConfirmed {
                    txid: tx.txid(),
                    height: block_height,
                });
            }
            for entry in conflicted {
                self.emit(ChainEvent::TransactionConflicted { tx: entry.tx });
            }
        }
        for tx in resurrect.into_iter().rev().flatten() {
            let txid = tx.txid();
            if let Err(e) = self.accept_to_memory_pool(tx, false) {
                if e.is_fatal() {
                    return Err(e);
                }
                debug!(%txid, error = %e, "disconnected transaction not returned to pool");
            }
        }

        self.emit(ChainEvent::BestChainChanged {
            locator: self.index.locator(target),
            height,
            hash,
        });
        Ok(SwitchOutcome::Switched)
    }

    // --- Operator actions ---

    /// Mark a block invalid and move the tip off it if needed.
    pub fn invalidate_block(&mut self, hash: &Hash256) -> Result<(), StrataError> {
        self.ensure_live()?;
        let result = self.invalidate_block_inner(hash);
        self.check_fatal(result)
    }

    fn invalidate_block_inner(&mut self, hash: &Hash256) -> Result<(), StrataError> {
        let id = self
            .index
            .lookup(hash)
            .ok_or_else(|| BlockError::UnknownBlock(hash.to_string()))?;
        let prev = self.index.get(id).prev.ok_or_else(|| BlockError::KnownInvalid(hash.to_string()))?;
        if self.index.in_active_chain(id) {
            match self.try_switch_to(prev)? {
                SwitchOutcome::Switched => {}
                SwitchOutcome::Invalid { error, .. } => return Err(error),
            }
        }
        self.index.mark_failed(id);
        self.index.rebuild_candidates();
        persist_index(&mut self.index, &mut *self.index_store, self.last_block_file)?;
        info!(%hash, "block invalidated by operator");
        self.activate_inner()?;
        Ok(())
    }

    /// Clear failure marks on a block and its relatives and reselect.
    pub fn reconsider_block(&mut self, hash: &Hash256) -> Result<(), StrataError> {
        self.ensure_live()?;
        let result = self.reconsider_block_inner(hash);
        self.check_fatal(result)
    }

    fn reconsider_block_inner(&mut self, hash: &Hash256) -> Result<(), StrataError> {
        let id = self
            .index
            .lookup(hash)
            .ok_or_else(|| BlockError::UnknownBlock(hash.to_string()))?;
        self.index.clear_failure(id);
        persist_index(&mut self.index, &mut *self.index_store, self.last_block_file)?;
        info!(%hash, "block reconsidered");
        self.activate_inner()?;
        Ok(())
    }

    /// Flush stores in dependency order: bodies, index, then coins.
    ///
    /// The coins cache is only written when `force` is set or it has grown
    /// past the configured size.
    pub fn flush(&mut self, force: bool) -> Result<(), StrataError> {
        self.ensure_live()?;
        let result = self.flush_inner(force);
        self.check_fatal(result)
    }

    fn flush_inner(&mut self, force: bool) -> Result<(), StrataError> {
        self.blocks.flush()?;
        self.undo.flush()?;
        persist_index(&mut self.index, &mut *self.index_store, self.last_block_file)?;
        if force || self.tip.dynamic_usage() > self.config.coins_cache_bytes {
            self.tip.flush()?;
            debug!(force, "flushed coins cache");
        }
        Ok(())
    }
}
