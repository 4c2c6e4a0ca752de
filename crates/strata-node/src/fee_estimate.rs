//! Confirmed fee-rate tracking with a JSON snapshot.
//!
//! The estimator watches chain events: a pool acceptance records the
//! transaction's fee rate, a confirmation moves that rate into a bounded
//! window of samples. The window is written to `fee_estimates.json` at
//! shutdown and read back at startup; it is never written in between.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strata_chain::ChainEvent;
use strata_core::types::Hash256;

use crate::error::NodeError;

/// Confirmed samples kept.
pub const MAX_SAMPLES: usize = 1_000;
/// Unconfirmed rates tracked at once.
const MAX_PENDING: usize = 10_000;

const SNAPSHOT_VERSION: u32 = 1;

/// Fee rate in base units per 1000 bytes.
fn fee_rate(fee: u64, size: usize) -> u64 {
    let size = size.max(1) as u128;
    (u128::from(fee) * 1000 / size).min(u128::from(u64::MAX)) as u64
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimator {
    version: u32,
    /// Height of the last block seen.
    best_height: u32,
    /// Fee rates of confirmed transactions, oldest first.
    samples: VecDeque<u64>,
    #[serde(skip)]
    pending: HashMap<Hash256, u64>,
}

impl FeeEstimator {
    pub fn new() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            ..Self::default()
        }
    }

    pub fn observe(&mut self, event: &ChainEvent) {
        match event {
            ChainEvent::TransactionAccepted { tx, fee, size } => {
                if self.pending.len() < MAX_PENDING {
                    self.pending.insert(tx.txid(), fee_rate(*fee, *size));
                }
            }
            ChainEvent::TransactionConfirmed { txid, height } => {
                self.best_height = self.best_height.max(*height);
                if let Some(rate) = self.pending.remove(txid) {
                    if self.samples.len() == MAX_SAMPLES {
                        self.samples.pop_front();
                    }
                    self.samples.push_back(rate);
                }
            }
            ChainEvent::TransactionConflicted { tx } => {
                self.pending.remove(&tx.txid());
            }
            ChainEvent::BestChainChanged { height, .. } => self.best_height = *height,
        }
    }

    /// Median confirmed fee rate, per 1000 bytes.
    pub fn estimate(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn best_height(&self) -> u32 {
        self.best_height
    }

    /// Read a snapshot. A missing, unreadable or outdated file starts empty.
    pub fn load(path: &Path) -> Self {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read fee estimates");
                return Self::new();
            }
        };
        match serde_json::from_slice::<Self>(&bytes) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => {
                debug!(samples = snapshot.samples.len(), "loaded fee estimates");
                snapshot
            }
            Ok(snapshot) => {
                warn!(version = snapshot.version, "ignoring fee estimates of unknown version");
                Self::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt fee estimates");
                Self::new()
            }
        }
    }

    /// Write the snapshot through a temporary file and a rename.
    pub fn save(&self, path: &Path) -> Result<(), NodeError> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| NodeError::Decode {
            what: "fee estimates",
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension("json.new");
        fs::write(&tmp, json).map_err(|e| NodeError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| NodeError::io(path, e))?;
        Ok(())
    }
}
