//! Parallel signature verification.
//!
//! Connecting a block collects one [`ScriptCheck`] per input and hands the
//! whole batch to a [`SigVerifier`], which runs them on a bounded rayon pool
//! and joins before the block is applied.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::warn;

use strata_core::error::BlockError;
use strata_core::validation::ScriptCheck;

/// A signature check tagged with the index of its transaction in the block.
pub type BlockScriptCheck<'a> = (usize, ScriptCheck<'a>);

/// Runs batches of signature checks.
pub struct SigVerifier {
    pool: Option<ThreadPool>,
}

impl std::fmt::Debug for SigVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigVerifier")
            .field("threads", &self.threads())
            .finish()
    }
}

impl SigVerifier {
    /// A verifier with `threads` workers. Zero verifies on the calling thread.
    pub fn new(threads: usize) -> Self {
        if threads == 0 {
            return Self { pool: None };
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("strata-sig-{i}"))
            .build();
        match pool {
            Ok(pool) => Self { pool: Some(pool) },
            Err(e) => {
                warn!(threads, error = %e, "signature thread pool unavailable, verifying inline");
                Self { pool: None }
            }
        }
    }

    pub fn threads(&self) -> usize {
        self.pool.as_ref().map_or(0, ThreadPool::current_num_threads)
    }

    /// Verify every check. On failure, reports the first failing check in
    /// block order so the result does not depend on scheduling.
    pub fn verify(&self, checks: &[BlockScriptCheck<'_>]) -> Result<(), BlockError> {
        if checks.is_empty() {
            return Ok(());
        }
        let all_ok = match &self.pool {
            Some(pool) => pool.install(|| checks.par_iter().all(|(_, check)| check.verify().is_ok())),
            None => checks.iter().all(|(_, check)| check.verify().is_ok()),
        };
        if all_ok {
            return Ok(());
        }
        checks
            .iter()
            .try_for_each(|(index, check)| {
                check.verify().map_err(|source| BlockError::TransactionError {
                    index: *index,
                    source,
                })
            })
    }
}

impl Default for SigVerifier {
    fn default() -> Self {
        Self::new(0)
    }
}
