//! Full node composition and event loop.
//!
//! The [`Node`] owns the one lock around the [`Chainstate`]: every entry
//! point takes it for the whole of its unit of work, so blocks,
//! transactions, imports and shutdown never interleave. Chain events fan
//! out through a broadcast channel and feed the fee estimator.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use strata_chain::{BlockOutcome, ChainEvent, ChainStores, Chainstate, TxOutcome};
use strata_core::error::StrataError;
use strata_core::params::ChainParams;
use strata_core::traits::{ConsensusHooks, IndexMetaKey, IndexStore, NoopHooks};
use strata_core::types::{Block, Hash256, Transaction};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::fee_estimate::FeeEstimator;
use crate::flatfiles::{self, FlatFileStore};
use crate::storage::ChainDb;

/// Chain events buffered per subscriber before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

const REINDEX_SOURCE_DIR: &str = "blocks.reindex";

/// Inbound notifications from the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A serialized block, with a label for where it came from.
    NewBlock { bytes: Vec<u8>, source: Option<String> },
    /// A serialized loose transaction.
    NewTransaction { bytes: Vec<u8> },
}

/// Counters of a bulk import.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    /// Records handed to the chain state.
    pub processed: usize,
    /// Records that failed to decode or validate.
    pub rejected: usize,
    pub cancelled: bool,
}

pub fn decode_block(bytes: &[u8]) -> Result<Block, NodeError> {
    let (block, read): (Block, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| NodeError::Decode {
            what: "block",
            reason: e.to_string(),
        })?;
    if read != bytes.len() {
        return Err(NodeError::Decode {
            what: "block",
            reason: format!("{} trailing bytes", bytes.len() - read),
        });
    }
    Ok(block)
}

pub fn decode_transaction(bytes: &[u8]) -> Result<Transaction, NodeError> {
    let (tx, read): (Transaction, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| NodeError::Decode {
            what: "transaction",
            reason: e.to_string(),
        })?;
    if read != bytes.len() {
        return Err(NodeError::Decode {
            what: "transaction",
            reason: format!("{} trailing bytes", bytes.len() - read),
        });
    }
    Ok(tx)
}

/// The full node.
pub struct Node {
    config: NodeConfig,
    /// The global chain lock.
    chain: Mutex<Chainstate>,
    db: ChainDb,
    events: broadcast::Sender<ChainEvent>,
    fees: Arc<Mutex<FeeEstimator>>,
    /// Old block files still to be replayed by a reindex.
    reindex_source: Mutex<Option<PathBuf>>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("network", &self.config.network)
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Open the node's stores and chain state with no-op consensus hooks.
    pub fn open(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        Self::open_with_hooks(config, Arc::new(NoopHooks))
    }

    pub fn open_with_hooks(config: NodeConfig, hooks: Arc<dyn ConsensusHooks>) -> Result<Arc<Self>, NodeError> {
        let chain_dir = config.chain_dir();
        fs::create_dir_all(&chain_dir).map_err(|e| NodeError::io(&chain_dir, e))?;

        let (db, reindex_source) = prepare_storage(&config)?;
        let blocks_dir = config.blocks_dir();
        let stores = ChainStores {
            coins: Box::new(db.coins_view()),
            blocks: Box::new(FlatFileStore::blocks(&blocks_dir, config.network)?),
            undo: Box::new(FlatFileStore::undo(&blocks_dir, config.network)?),
            index: Box::new(db.index_store()),
        };
        let params = ChainParams::for_network(config.network);
        let mut chain = Chainstate::open(params, config.chainstate_config(), stores, hooks)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let fees = Arc::new(Mutex::new(FeeEstimator::load(&config.fee_estimates_path())));
        {
            let events = events.clone();
            let fees = Arc::clone(&fees);
            chain.add_listener(Box::new(move |event: &ChainEvent| {
                fees.lock().observe(event);
                // Nobody subscribed is fine.
                let _ = events.send(event.clone());
            }));
        }

        info!(
            network = ?config.network,
            data_dir = %chain_dir.display(),
            height = chain.height(),
            tip = %chain.tip_hash(),
            coin_records = db.estimated_coin_records().unwrap_or(0),
            "node opened"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            chain: Mutex::new(chain),
            db,
            events,
            fees,
            reindex_source: Mutex::new(reindex_source),
            shutdown,
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Run `f` with the chain lock held.
    pub fn with_chain<R>(&self, f: impl FnOnce(&mut Chainstate) -> R) -> R {
        f(&mut self.chain.lock())
    }

    /// Height and hash of the active tip.
    pub fn tip(&self) -> (u32, Hash256) {
        let chain = self.chain.lock();
        (chain.height(), chain.tip_hash())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Median confirmed fee rate per 1000 bytes.
    pub fn fee_estimate(&self) -> Option<u64> {
        self.fees.lock().estimate()
    }

    // --- Inbound work ---

    pub fn submit_block(&self, block: Block) -> Result<BlockOutcome, StrataError> {
        let result = self.chain.lock().process_block(block);
        self.note_fatal(&result);
        result
    }

    pub fn submit_transaction(&self, tx: Transaction) -> Result<TxOutcome, StrataError> {
        let result = self.chain.lock().process_transaction(tx);
        self.note_fatal(&result);
        result
    }

    fn note_fatal<T>(&self, result: &Result<T, StrataError>) {
        if let Err(e) = result {
            if e.is_fatal() && !self.shutdown_requested() {
                error!(error = %e, "fatal chain error, requesting shutdown");
                self.request_shutdown();
            }
        }
    }

    /// Decode and apply one inbound event.
    pub fn handle_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::NewBlock { bytes, source } => {
                let source = source.as_deref().unwrap_or("unknown");
                let block = match decode_block(&bytes) {
                    Ok(block) => block,
                    Err(e) => {
                        debug!(source, error = %e, "dropped undecodable block");
                        return;
                    }
                };
                let hash = block.hash();
                match self.submit_block(block) {
                    Ok(outcome) => debug!(source, ?outcome, "processed block"),
                    Err(e) if e.is_fatal() => {}
                    Err(e) if e.is_missing_dependency() => debug!(source, %hash, error = %e, "block waits for its parent"),
                    Err(e) => warn!(source, %hash, error = %e, misbehavior = e.misbehavior(), "rejected block"),
                }
            }
            NodeEvent::NewTransaction { bytes } => {
                let tx = match decode_transaction(&bytes) {
                    Ok(tx) => tx,
                    Err(e) => {
                        debug!(error = %e, "dropped undecodable transaction");
                        return;
                    }
                };
                let txid = tx.txid();
                match self.submit_transaction(tx) {
                    Ok(outcome) => debug!(?outcome, "processed transaction"),
                    Err(e) => debug!(%txid, error = %e, misbehavior = e.misbehavior(), "rejected transaction"),
                }
            }
        }
    }

    /// Consume inbound events until the channel closes or shutdown is
    /// requested. Each event is handled on the blocking pool.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<NodeEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                info!("shutdown requested, leaving event loop");
                break;
            }
            tokio::select! {
                event = inbound.recv() => {
                    let Some(event) = event else {
                        info!("inbound event channel closed");
                        break;
                    };
                    let node = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || node.handle_event(event)).await {
                        error!(error = %e, "event handler failed");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // --- Bulk import ---

    /// Feed every block record of `paths` through the chain state, then
    /// flush everything. `cancel` is checked between blocks.
    pub fn import_blocks(&self, paths: &[PathBuf], cancel: &AtomicBool) -> Result<ImportStats, NodeError> {
        let magic = self.config.network.magic_bytes();
        let mut stats = ImportStats::default();

        'files: for path in paths {
            info!(path = %path.display(), "importing blocks");
            for record in flatfiles::read_records(path, magic)? {
                if cancel.load(Ordering::Relaxed) || self.shutdown_requested() {
                    stats.cancelled = true;
                    break 'files;
                }
                let record = match record {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "stopped reading import file");
                        break;
                    }
                };
                stats.processed += 1;
                let block = match decode_block(&record) {
                    Ok(block) => block,
                    Err(e) => {
                        warn!(error = %e, "skipped undecodable block record");
                        stats.rejected += 1;
                        continue;
                    }
                };
                match self.submit_block(block) {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) if e.is_missing_dependency() => {}
                    Err(e) => {
                        debug!(error = %e, "import rejected block");
                        stats.rejected += 1;
                    }
                }
            }
        }

        self.chain.lock().flush(true)?;
        let (height, hash) = self.tip();
        info!(
            processed = stats.processed,
            rejected = stats.rejected,
            cancelled = stats.cancelled,
            height,
            %hash,
            "block import finished"
        );
        Ok(stats)
    }

    /// Whether a reindex still has block files to replay.
    pub fn reindex_pending(&self) -> bool {
        self.reindex_source.lock().is_some()
    }

    /// Replay the block files set aside by a reindex. A cancelled run leaves
    /// the reindex marker in place so the next start begins it again.
    pub fn resume_reindex(&self, cancel: &AtomicBool) -> Result<Option<ImportStats>, NodeError> {
        let Some(source) = self.reindex_source.lock().clone() else {
            return Ok(None);
        };
        let files = flatfiles::block_files(&source)?;
        info!(files = files.len(), "reindexing from stored block files");
        let stats = self.import_blocks(&files, cancel)?;
        if stats.cancelled {
            info!("reindex interrupted, it restarts on the next start");
            return Ok(Some(stats));
        }

        set_reindexing(&self.db, false)?;
        fs::remove_dir_all(&source).map_err(|e| NodeError::io(&source, e))?;
        *self.reindex_source.lock() = None;
        info!("reindex complete");
        Ok(Some(stats))
    }

    // --- Shutdown ---

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Flush all chain state and write the fee-estimate snapshot. Runs once.
    pub fn shutdown(&self) -> Result<(), NodeError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.request_shutdown();

        let flushed = {
            let mut chain = self.chain.lock();
            if chain.is_halted() {
                warn!("chain state halted, skipping final flush");
                Ok(())
            } else {
                chain.flush(true)
            }
        };
        if let Err(e) = self.fees.lock().save(&self.config.fee_estimates_path()) {
            warn!(error = %e, "failed to write fee estimates");
        }
        flushed?;
        info!("node shut down cleanly");
        Ok(())
    }
}

fn set_reindexing(db: &ChainDb, on: bool) -> Result<(), NodeError> {
    db.index_store()
        .write_batch(&[], &[(IndexMetaKey::Reindexing, vec![u8::from(on)])])?;
    Ok(())
}

/// Open the chain database. On a requested or interrupted reindex, wipe it
/// and set the block files aside for replay.
fn prepare_storage(config: &NodeConfig) -> Result<(ChainDb, Option<PathBuf>), NodeError> {
    let db_path = config.db_path();
    let db = ChainDb::open(&db_path)?;
    let interrupted = db
        .index_store()
        .read_meta(IndexMetaKey::Reindexing)?
        .is_some_and(|v| v == [1]);
    if !config.reindex && !interrupted {
        return Ok((db, None));
    }
    if interrupted {
        warn!("previous reindex did not finish, starting it again");
    } else {
        info!("reindex requested, wiping chain state");
    }

    drop(db);
    ChainDb::destroy(&db_path)?;
    let source = config.chain_dir().join(REINDEX_SOURCE_DIR);
    set_aside_blocks(&config.blocks_dir(), &source)?;

    let db = ChainDb::open(&db_path)?;
    set_reindexing(&db, true)?;
    Ok((db, Some(source)))
}

/// Move the block files to `source`, unless an earlier attempt already did
/// and the current directory only holds a partial rebuild.
fn set_aside_blocks(blocks_dir: &Path, source: &Path) -> Result<(), NodeError> {
    if source.exists() {
        if blocks_dir.exists() {
            fs::remove_dir_all(blocks_dir).map_err(|e| NodeError::io(blocks_dir, e))?;
        }
    } else if blocks_dir.exists() {
        fs::rename(blocks_dir, source).map_err(|e| NodeError::io(source, e))?;
    } else {
        fs::create_dir_all(source).map_err(|e| NodeError::io(source, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_chain::mining::Miner;
    use strata_core::constants::NetworkType;
    use strata_core::crypto::KeyPair;

    const T0: u32 = 1_700_000_000;

    /// Regtest node backed by a temp directory.
    fn test_node(dir: &Path) -> Arc<Node> {
        Node::open(test_config(dir)).unwrap()
    }

    fn test_config(dir: &Path) -> NodeConfig {
        NodeConfig {
            data_dir: dir.to_path_buf(),
            network: NetworkType::Regtest,
            ..NodeConfig::default()
        }
    }

    fn miner() -> Miner {
        Miner::new(KeyPair::from_secret_bytes([0xBB; 32]))
    }

    fn mine(node: &Node, m: &Miner, count: u32) -> Vec<Block> {
        let mut blocks = Vec::new();
        for _ in 0..count {
            let (height, _) = node.tip();
            let block = node.with_chain(|c| m.pow_block(c, vec![], T0 + 60 * (height + 1)));
            node.submit_block(block.clone()).unwrap();
            blocks.push(block);
        }
        blocks
    }

    // --- Startup and blocks ---

    #[test]
    fn node_starts_with_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path());
        let (height, hash) = node.tip();
        assert_eq!(height, 0);
        assert_eq!(hash, strata_core::genesis::genesis_block(&ChainParams::regtest()).hash());
        assert!(!node.reindex_pending());
    }

    #[test]
    fn submitted_blocks_extend_tip_and_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path());
        let mut rx = node.subscribe();
        let blocks = mine(&node, &miner(), 2);
        assert_eq!(node.tip(), (2, blocks[1].hash()));

        let mut tips = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ChainEvent::BestChainChanged { height, .. } = event {
                tips.push(height);
            }
        }
        assert_eq!(tips, vec![1, 2]);
    }

    #[test]
    fn undecodable_bytes_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path());
        node.handle_event(NodeEvent::NewBlock {
            bytes: vec![1, 2, 3],
            source: Some("peer".into()),
        });
        node.handle_event(NodeEvent::NewTransaction { bytes: vec![] });
        assert_eq!(node.tip().0, 0);
        assert!(matches!(decode_block(&[0xff]), Err(NodeError::Decode { what: "block", .. })));
    }

    #[test]
    fn restart_restores_tip() {
        let dir = tempfile::tempdir().unwrap();
        let tip = {
            let node = test_node(dir.path());
            mine(&node, &miner(), 3);
            node.shutdown().unwrap();
            node.tip()
        };
        let node = test_node(dir.path());
        assert_eq!(node.tip(), tip);
        assert!(dir.path().join("regtest").join("fee_estimates.json").exists());
    }

    // --- Import and reindex ---

    #[test]
    fn import_replays_block_files() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = test_node(source_dir.path());
        mine(&source, &miner(), 4);
        let expected = source.tip();
        source.shutdown().unwrap();
        let files = flatfiles::block_files(&source.config().blocks_dir()).unwrap();
        drop(source);

        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path());
        let stats = node.import_blocks(&files, &AtomicBool::new(false)).unwrap();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.rejected, 0);
        assert!(!stats.cancelled);
        assert_eq!(node.tip(), expected);
    }

    #[test]
    fn cancelled_import_stops_between_blocks() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = test_node(source_dir.path());
        mine(&source, &miner(), 2);
        source.shutdown().unwrap();
        let files = flatfiles::block_files(&source.config().blocks_dir()).unwrap();
        drop(source);

        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path());
        let stats = node.import_blocks(&files, &AtomicBool::new(true)).unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.processed, 0);
        assert_eq!(node.tip().0, 0);
    }

    #[test]
    fn reindex_rebuilds_chain_state() {
        let dir = tempfile::tempdir().unwrap();
        let expected = {
            let node = test_node(dir.path());
            mine(&node, &miner(), 3);
            node.shutdown().unwrap();
            node.tip()
        };

        let config = NodeConfig {
            reindex: true,
            ..test_config(dir.path())
        };
        let node = Node::open(config).unwrap();
        assert!(node.reindex_pending());
        assert_eq!(node.tip().0, 0);

        let stats = node.resume_reindex(&AtomicBool::new(false)).unwrap().unwrap();
        assert!(!stats.cancelled);
        assert_eq!(node.tip(), expected);
        assert!(!node.reindex_pending());
        assert!(!dir.path().join("regtest").join(REINDEX_SOURCE_DIR).exists());
    }

    #[test]
    fn interrupted_reindex_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let expected = {
            let node = test_node(dir.path());
            mine(&node, &miner(), 2);
            node.shutdown().unwrap();
            node.tip()
        };
        {
            let node = Node::open(NodeConfig {
                reindex: true,
                ..test_config(dir.path())
            })
            .unwrap();
            let stats = node.resume_reindex(&AtomicBool::new(true)).unwrap().unwrap();
            assert!(stats.cancelled);
        }
        // No flag this time: the marker alone resumes the reindex.
        let node = test_node(dir.path());
        assert!(node.reindex_pending());
        node.resume_reindex(&AtomicBool::new(false)).unwrap();
        assert_eq!(node.tip(), expected);
    }

    // --- Event loop and shutdown ---

    #[tokio::test]
    async fn run_loop_applies_inbound_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path());
        let block = node.with_chain(|c| miner().pow_block(c, vec![], T0 + 60));
        let bytes = bincode::encode_to_vec(&block, bincode::config::standard()).unwrap();

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(Arc::clone(&node).run(rx));
        tx.send(NodeEvent::NewBlock { bytes, source: None }).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(node.tip(), (1, block.hash()));
    }

    #[tokio::test]
    async fn shutdown_request_stops_run_loop() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path());
        let (_tx, rx) = mpsc::channel::<NodeEvent>(8);
        let handle = tokio::spawn(Arc::clone(&node).run(rx));
        node.request_shutdown();
        handle.await.unwrap();
        node.shutdown().unwrap();
        // A second shutdown is a no-op.
        node.shutdown().unwrap();
    }
}
