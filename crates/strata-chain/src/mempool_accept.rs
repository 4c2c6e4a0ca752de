//! Admission of loose transactions into the pool.
//!
//! [`Chainstate::accept_to_memory_pool`] validates a transaction against the
//! tip plus the pool and inserts it. [`Chainstate::process_transaction`]
//! wraps it for relayed transactions: a transaction with unknown parents is
//! held as an orphan, and every acceptance retries the orphans waiting on it.

use std::collections::VecDeque;

use tracing::debug;

use strata_core::constants::MAX_STANDARD_TX_SIGOPS;
use strata_core::error::{MempoolError, StrataError, TransactionError};
use strata_core::fees::{self, FeeMode};
use strata_core::mempool::MempoolEntry;
use strata_core::types::{Hash256, Transaction};
use strata_core::validation::{self, FeeRule, InputContext};
use strata_core::view::{CoinsCache, MempoolCoinsView};

use crate::chainstate::Chainstate;
use crate::events::ChainEvent;

/// Result of [`Chainstate::process_transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// In the pool, along with any orphans it unlocked.
    Accepted { txid: Hash256, unlocked: Vec<Hash256> },
    /// Held until its missing parents arrive.
    Orphaned { txid: Hash256 },
}

impl Chainstate {
    /// Validate `tx` against the tip and the pool and insert it.
    ///
    /// `limit_free` applies the relay fee floor and the free-transaction rate
    /// limiter; transactions returned from disconnected blocks skip both.
    pub fn accept_to_memory_pool(&mut self, tx: Transaction, limit_free: bool) -> Result<Hash256, StrataError> {
        self.ensure_live()?;
        let result = self.accept_inner(tx, limit_free);
        self.check_fatal(result)
    }

    fn accept_inner(&mut self, tx: Transaction, limit_free: bool) -> Result<Hash256, StrataError> {
        let txid = tx.txid();
        validation::check_transaction(&tx)?;
        if tx.is_coinbase() || tx.is_coinstake() {
            return Err(MempoolError::CoinbaseNotAllowed.into());
        }
        validation::check_standard(&tx)?;

        let next_height = self.height() + 1;
        if !tx.is_final(next_height, self.adjusted_time() as u32) {
            return Err(TransactionError::NonFinal.into());
        }

        if self.mempool.contains(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_string()).into());
        }
        for input in &tx.inputs {
            if let Some(existing) = self.mempool.spender_of(&input.previous_output) {
                return Err(MempoolError::Conflict {
                    new_txid: txid.to_string(),
                    existing_txid: existing.to_string(),
                    outpoint: input.previous_output.to_string(),
                }
                .into());
            }
        }
        if let Some(locked) = self.hooks.tx_lock_conflict(&tx) {
            return Err(TransactionError::LockConflict(locked.to_string()).into());
        }
        if self.tip.access_coins(&txid)?.is_some() {
            return Err(MempoolError::AlreadyConfirmed(txid.to_string()).into());
        }

        let ctx = InputContext {
            spend_height: next_height,
            fee_rule: limit_free.then(|| FeeRule::relay(true)),
            verify_scripts: true,
        };
        let summary = {
            let mut view = CoinsCache::new(MempoolCoinsView::new(&mut self.tip, &self.mempool));
            validation::check_inputs(&tx, &mut view, &ctx, &self.params, None)?
        };

        let sigops = validation::legacy_sigop_count(&tx);
        if sigops > MAX_STANDARD_TX_SIGOPS {
            return Err(TransactionError::TooManySigops {
                count: sigops,
                max: MAX_STANDARD_TX_SIGOPS,
            }
            .into());
        }

        let size = tx.encoded_size();
        let now = self.adjusted_time();
        if limit_free && summary.fee < fees::min_fee(&tx, 0, FeeMode::Relay, false) {
            self.free_limiter.check(size, now)?;
            debug!(%txid, size, "admitted free transaction");
        }

        let entry = MempoolEntry::new(tx.clone(), summary.fee, now, self.height());
        let evicted = self.mempool.add_unchecked(entry)?;
        debug!(
            %txid,
            fee = summary.fee,
            size,
            evicted = evicted.len(),
            pool = self.mempool.len(),
            "accepted transaction"
        );
        self.emit(ChainEvent::TransactionAccepted {
            tx,
            fee: summary.fee,
            size,
        });
        Ok(txid)
    }

    /// Accept a relayed transaction, holding it as an orphan when its
    /// parents are unknown.
    pub fn process_transaction(&mut self, tx: Transaction) -> Result<TxOutcome, StrataError> {
        self.ensure_live()?;
        let now = self.adjusted_time();
        let expired = self.orphan_txs.expire(now);
        if expired > 0 {
            debug!(expired, "expired orphan transactions");
        }

        let txid = tx.txid();
        match self.accept_to_memory_pool(tx.clone(), true) {
            Ok(_) => {}
            Err(e) if e.is_missing_dependency() => {
                self.orphan_txs.add(tx, now)?;
                debug!(%txid, orphans = self.orphan_txs.len(), "holding orphan transaction");
                return Ok(TxOutcome::Orphaned { txid });
            }
            Err(e) => return Err(e),
        }

        let unlocked = self.process_orphans(txid, now)?;
        Ok(TxOutcome::Accepted { txid, unlocked })
    }

    /// Retry orphans that spend `parent`, and their own children in turn.
    fn process_orphans(&mut self, parent: Hash256, now: u64) -> Result<Vec<Hash256>, StrataError> {
        let mut unlocked = Vec::new();
        let mut queue = VecDeque::from([parent]);
        while let Some(parent) = queue.pop_front() {
            for child in self.orphan_txs.children_of(&parent) {
                let Some(tx) = self.orphan_txs.remove(&child) else { continue };
                match self.accept_to_memory_pool(tx.clone(), true) {
                    Ok(txid) => {
                        unlocked.push(txid);
                        queue.push_back(txid);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) if e.is_missing_dependency() => {
                        self.orphan_txs.add(tx, now)?;
                    }
                    Err(e) => debug!(txid = %child, error = %e, "dropped orphan transaction"),
                }
            }
        }
        Ok(unlocked)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mining::Miner;
    use parking_lot::Mutex;
    use strata_core::constants::{COIN, MIN_TX_FEE};
    use strata_core::crypto::KeyPair;
    use strata_core::params::ChainParams;
    use strata_core::types::{OutPoint, TxOutput};

    const T0: u32 = 1_700_000_000;

    /// A chain with a mature coinbase owned by the returned miner.
    fn funded() -> (Chainstate, Miner, OutPoint) {
        let mut cs = Chainstate::in_memory(ChainParams::regtest(), || u64::from(T0) + 1_000_000).unwrap();
        let m = Miner::new(KeyPair::from_secret_bytes([5; 32]));
        let first = m.pow_block(&cs, vec![], T0 + 60);
        let reward = OutPoint::new(first.transactions[0].txid(), 0);
        cs.process_block(first).unwrap();
        for i in 2..=11 {
            let b = m.pow_block(&cs, vec![], T0 + 60 * i);
            cs.process_block(b).unwrap();
        }
        (cs, m, reward)
    }

    // --- Admission ---

    #[test]
    fn accepts_valid_spend_and_emits() {
        let (mut cs, m, reward) = funded();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cs.add_listener(Box::new(move |e: &ChainEvent| sink.lock().push(e.clone())));

        let tx = m.spend(reward, 50 * COIN, T0 + 700);
        let txid = cs.accept_to_memory_pool(tx, true).unwrap();
        assert!(cs.mempool().contains(&txid));
        assert_eq!(cs.mempool().entry(&txid).unwrap().fee, MIN_TX_FEE);
        assert!(matches!(seen.lock()[0], ChainEvent::TransactionAccepted { fee: MIN_TX_FEE, .. }));
    }

    #[test]
    fn duplicate_and_conflict_rejected() {
        let (mut cs, m, reward) = funded();
        let tx = m.spend(reward, 50 * COIN, T0 + 700);
        cs.accept_to_memory_pool(tx.clone(), true).unwrap();
        assert!(matches!(
            cs.accept_to_memory_pool(tx, true),
            Err(StrataError::Mempool(MempoolError::AlreadyExists(_)))
        ));
        let rival = m.spend(reward, 50 * COIN, T0 + 701);
        assert!(matches!(
            cs.accept_to_memory_pool(rival, true),
            Err(StrataError::Mempool(MempoolError::Conflict { .. }))
        ));
    }

    #[test]
    fn coinbase_rejected() {
        let (mut cs, m, _) = funded();
        let block = m.pow_block(&cs, vec![], T0 + 800);
        let err = cs.accept_to_memory_pool(block.transactions[0].clone(), true).unwrap_err();
        assert_eq!(err, StrataError::Mempool(MempoolError::CoinbaseNotAllowed));
    }

    #[test]
    fn immature_coinbase_spend_rejected() {
        let (mut cs, m, _) = funded();
        let tip_block = cs.block(&cs.tip_hash()).unwrap().unwrap();
        let young = OutPoint::new(tip_block.transactions[0].txid(), 0);
        let err = cs.accept_to_memory_pool(m.spend(young, 50 * COIN, T0 + 700), true).unwrap_err();
        assert!(matches!(err, StrataError::Transaction(TransactionError::ImmatureSpend { .. })));
    }

    #[test]
    fn free_transaction_rate_limited() {
        let (mut cs, m, reward) = funded();
        cs.free_limiter = strata_core::mempool::FreeTxLimiter::new(0);
        let free = m.spend_with_fee(&[(reward, 50 * COIN)], vec![TxOutput {
            value: 50 * COIN,
            script_pubkey: m.script(),
        }], T0 + 700);
        let err = cs.accept_to_memory_pool(free.clone(), true).unwrap_err();
        assert_eq!(err, StrataError::Mempool(MempoolError::RateLimited));
        // Without the limiter the same transaction is fine.
        cs.accept_to_memory_pool(free, false).unwrap();
    }

    // --- Orphans ---

    #[test]
    fn orphan_accepted_when_parent_arrives() {
        let (mut cs, m, reward) = funded();
        let parent = m.spend(reward, 50 * COIN, T0 + 700);
        let child = m.spend(OutPoint::new(parent.txid(), 0), 50 * COIN - MIN_TX_FEE, T0 + 701);
        let child_id = child.txid();

        assert_eq!(cs.process_transaction(child).unwrap(), TxOutcome::Orphaned { txid: child_id });
        assert_eq!(cs.orphan_tx_count(), 1);

        let outcome = cs.process_transaction(parent).unwrap();
        assert!(matches!(outcome, TxOutcome::Accepted { ref unlocked, .. } if unlocked == &vec![child_id]));
        assert!(cs.mempool().contains(&child_id));
        assert_eq!(cs.orphan_tx_count(), 0);
    }

    #[test]
    fn mined_transaction_leaves_pool() {
        let (mut cs, m, reward) = funded();
        let tx = m.spend(reward, 50 * COIN, T0 + 700);
        let txid = cs.accept_to_memory_pool(tx.clone(), true).unwrap();
        let block = m.pow_block(&cs, vec![tx.clone()], T0 + 720);
        cs.process_block(block).unwrap();
        assert!(!cs.mempool().contains(&txid));
        assert!(matches!(
            cs.accept_to_memory_pool(tx, true),
            Err(StrataError::Mempool(MempoolError::AlreadyConfirmed(_)))
        ));
    }
}
