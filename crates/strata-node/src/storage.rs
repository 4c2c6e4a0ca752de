//! RocksDB-backed coin and block index stores.
//!
//! One database holds three column families:
//! - `coins`: txid → bincode [`Coins`] record of its unspent outputs
//! - `block_index`: block hash → bincode [`DiskIndexEntry`]
//! - `meta`: the coins best-block pointer and the [`IndexMetaKey`] singletons
//!
//! [`ChainDb`] owns the handle; [`RocksCoinsView`] and [`RocksIndexStore`]
//! share it and every mutation goes through an atomic [`WriteBatch`].

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};

use strata_core::coins::Coins;
use strata_core::error::FatalError;
use strata_core::traits::{DiskIndexEntry, IndexMetaKey, IndexStore};
use strata_core::types::Hash256;
use strata_core::view::{CoinsDelta, CoinsView};

// --- Column family names ---

const CF_COINS: &str = "coins";
const CF_BLOCK_INDEX: &str = "block_index";
const CF_META: &str = "meta";

/// All column family names.
const ALL_CFS: &[&str] = &[CF_COINS, CF_BLOCK_INDEX, CF_META];

// --- Metadata keys ---

const META_BEST_BLOCK: &[u8] = b"best_block";

fn storage_err(e: impl std::fmt::Display) -> FatalError {
    FatalError::Storage(e.to_string())
}

fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily, FatalError> {
    db.cf_handle(name)
        .ok_or_else(|| FatalError::Storage(format!("column family '{name}' not found")))
}

fn decode_coins(txid: &Hash256, bytes: &[u8]) -> Result<Coins, FatalError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(coins, _)| coins)
        .map_err(|e| FatalError::Corruption(format!("coins {txid}: {e}")))
}

/// Handle to the chain database.
#[derive(Clone)]
pub struct ChainDb {
    db: Arc<DB>,
}

impl std::fmt::Debug for ChainDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainDb").field("path", &self.db.path()).finish()
    }
}

impl ChainDb {
    /// Open or create the database, creating missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FatalError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(storage_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Delete the database at `path`. It must not be open.
    pub fn destroy(path: impl AsRef<Path>) -> Result<(), FatalError> {
        DB::destroy(&Options::default(), path.as_ref()).map_err(storage_err)
    }

    pub fn coins_view(&self) -> RocksCoinsView {
        RocksCoinsView { db: Arc::clone(&self.db) }
    }

    pub fn index_store(&self) -> RocksIndexStore {
        RocksIndexStore { db: Arc::clone(&self.db) }
    }

    /// RocksDB's estimate of the number of coin records.
    pub fn estimated_coin_records(&self) -> Result<u64, FatalError> {
        let cf = cf_handle(&self.db, CF_COINS)?;
        let estimate = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")
            .map_err(storage_err)?;
        Ok(estimate.unwrap_or(0))
    }

    /// Compact every column family.
    pub fn compact(&self) -> Result<(), FatalError> {
        for name in ALL_CFS {
            let cf = cf_handle(&self.db, name)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }
}

/// Persistent leaf of the UTXO view stack.
pub struct RocksCoinsView {
    db: Arc<DB>,
}

impl CoinsView for RocksCoinsView {
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, FatalError> {
        let cf = cf_handle(&self.db, CF_COINS)?;
        match self.db.get_cf(cf, txid.as_bytes()).map_err(storage_err)? {
            Some(bytes) => decode_coins(txid, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn have_coins(&mut self, txid: &Hash256) -> Result<bool, FatalError> {
        let cf = cf_handle(&self.db, CF_COINS)?;
        self.db
            .get_pinned_cf(cf, txid.as_bytes())
            .map(|v| v.is_some())
            .map_err(storage_err)
    }

    fn best_block(&mut self) -> Result<Hash256, FatalError> {
        let cf = cf_handle(&self.db, CF_META)?;
        match self.db.get_cf(cf, META_BEST_BLOCK).map_err(storage_err)? {
            Some(bytes) => {
                let raw: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| FatalError::Corruption("invalid best block length".into()))?;
                Ok(Hash256::from_bytes(raw))
            }
            None => Ok(Hash256::ZERO),
        }
    }

    fn batch_write(&mut self, delta: CoinsDelta, best: Hash256) -> Result<(), FatalError> {
        let coins_cf = cf_handle(&self.db, CF_COINS)?;
        let meta_cf = cf_handle(&self.db, CF_META)?;
        let mut batch = WriteBatch::default();
        for (txid, coins) in &delta {
            match coins {
                Some(coins) if !coins.is_pruned() => {
                    let bytes = bincode::encode_to_vec(coins, bincode::config::standard()).map_err(storage_err)?;
                    batch.put_cf(coins_cf, txid.as_bytes(), bytes);
                }
                _ => batch.delete_cf(coins_cf, txid.as_bytes()),
            }
        }
        batch.put_cf(meta_cf, META_BEST_BLOCK, best.as_bytes());
        self.db.write(batch).map_err(storage_err)
    }
}

/// Persistent block index.
pub struct RocksIndexStore {
    db: Arc<DB>,
}

impl IndexStore for RocksIndexStore {
    fn load_all(&self) -> Result<Vec<DiskIndexEntry>, FatalError> {
        let cf = cf_handle(&self.db, CF_BLOCK_INDEX)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(storage_err)?;
            let entry = DiskIndexEntry::decode(&value)?;
            if entry.hash.as_bytes().as_slice() != &*key {
                return Err(FatalError::Corruption(format!("index entry {} stored under another key", entry.hash)));
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn write_batch(
        &mut self,
        entries: &[DiskIndexEntry],
        meta: &[(IndexMetaKey, Vec<u8>)],
    ) -> Result<(), FatalError> {
        let index_cf = cf_handle(&self.db, CF_BLOCK_INDEX)?;
        let meta_cf = cf_handle(&self.db, CF_META)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(index_cf, entry.hash.as_bytes(), entry.encode()?);
        }
        for (key, value) in meta {
            batch.put_cf(meta_cf, key.as_bytes(), value);
        }
        self.db.write(batch).map_err(storage_err)
    }

    fn read_meta(&self, key: IndexMetaKey) -> Result<Option<Vec<u8>>, FatalError> {
        let cf = cf_handle(&self.db, CF_META)?;
        self.db.get_cf(cf, key.as_bytes()).map_err(storage_err)
    }
}
