//! Applying blocks to, and removing them from, a UTXO view.
//!
//! [`connect_block`] spends every input, adds every output, checks inputs,
//! reward ceilings and hook predicates, and returns the undo record. It only
//! mutates the cache it is given; the chain state machine hands it a
//! throwaway layer and discards that layer on failure.
//!
//! [`disconnect_block`] is the exact inverse, driven by the undo record.

use tracing::warn;

use strata_core::coins::{self, BlockUndo, TxUndo};
use strata_core::error::{BlockError, FatalError, StrataError, TransactionError};
use strata_core::kernel::{self, StakeInput};
use strata_core::params::ChainParams;
use strata_core::reward;
use strata_core::traits::{ConsensusHooks, Spork};
use strata_core::types::{Block, Hash256};
use strata_core::validation::{self, FeeRule, InputContext, ScriptCheck};
use strata_core::view::{CoinsCache, CoinsView};

use crate::sigcheck::{BlockScriptCheck, SigVerifier};

/// What `connect_block` needs to know about the block's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectContext {
    pub height: u32,
    /// Stake modifier of the parent; the kernel commits to it.
    pub stake_modifier: u64,
    pub verify_scripts: bool,
}

/// Results of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedBlock {
    pub undo: BlockUndo,
    pub fees: u64,
    pub value_in: u64,
    pub value_out: u64,
    /// Kernel hash for proof-of-stake, block hash otherwise.
    pub proof_hash: Hash256,
}

impl ConnectedBlock {
    /// Newly created money: `value_out - value_in`, floored at zero.
    pub fn mint(&self) -> u64 {
        self.value_out.saturating_sub(self.value_in)
    }
}

fn tx_error(index: usize, err: StrataError) -> StrataError {
    match err {
        StrataError::Transaction(source) => BlockError::TransactionError { index, source }.into(),
        other => other,
    }
}

/// Connect `block` at `ctx.height` on top of `view`.
pub fn connect_block<V: CoinsView>(
    block: &Block,
    ctx: &ConnectContext,
    view: &mut CoinsCache<V>,
    verifier: &SigVerifier,
    hooks: &dyn ConsensusHooks,
    params: &ChainParams,
) -> Result<ConnectedBlock, StrataError> {
    let hash = block.hash();

    for tx in &block.transactions {
        let txid = tx.txid();
        if view.access_coins(&txid)?.is_some() {
            return Err(BlockError::OverwritesUnspent(txid.to_string()).into());
        }
    }

    let proof_hash = match block.coinstake() {
        Some(coinstake) => {
            let prevout = coinstake.inputs[0].previous_output;
            let (value, coin_time) = match view.access_coins(&prevout.txid)? {
                Some(coins) => match coins.output(prevout.index) {
                    Some(output) => (output.value, coins.time),
                    None => return Err(BlockError::StakeInputMissing(prevout.to_string()).into()),
                },
                None => return Err(BlockError::StakeInputMissing(prevout.to_string()).into()),
            };
            let input = StakeInput { prevout, value, coin_time };
            kernel::check_stake_kernel(block.header.bits, ctx.stake_modifier, &input, block.header.time, params)?
        }
        None => hash,
    };

    let lock_filtering = hooks.is_spork_active(Spork::TxLockBlockFiltering);
    let input_ctx = InputContext {
        spend_height: ctx.height,
        fee_rule: Some(FeeRule::block()),
        verify_scripts: ctx.verify_scripts,
    };

    let mut undo = BlockUndo::default();
    let mut checks: Vec<BlockScriptCheck<'_>> = Vec::new();
    let mut fees: u64 = 0;
    let mut value_in: u64 = 0;
    let mut value_out: u64 = 0;
    let mut stake_claim: Option<(u64, u64)> = None;

    for (index, tx) in block.transactions.iter().enumerate() {
        let out = tx
            .total_output_value()
            .ok_or(BlockError::TransactionError { index, source: TransactionError::OutputTotalOutOfRange })?;
        value_out = value_out.checked_add(out).ok_or(BlockError::SupplyOutOfRange)?;

        if !tx.is_coinbase() {
            if lock_filtering {
                if let Some(locked) = hooks.tx_lock_conflict(tx) {
                    return Err(BlockError::TransactionError {
                        index,
                        source: TransactionError::LockConflict(locked.to_string()),
                    }
                    .into());
                }
            }

            let mut tx_checks: Vec<ScriptCheck<'_>> = Vec::new();
            let summary = validation::check_inputs(tx, view, &input_ctx, params, Some(&mut tx_checks))
                .map_err(|e| tx_error(index, e))?;
            checks.extend(tx_checks.into_iter().map(|c| (index, c)));
            value_in = value_in.checked_add(summary.value_in).ok_or(BlockError::SupplyOutOfRange)?;

            if tx.is_coinstake() {
                stake_claim = Some((summary.value_out.saturating_sub(summary.value_in), summary.coin_age));
            } else {
                fees = fees.checked_add(summary.fee).ok_or(BlockError::SupplyOutOfRange)?;
            }

            let mut prevouts = Vec::with_capacity(tx.inputs.len());
            for input in &tx.inputs {
                let spent = view.spend(&input.previous_output)?.ok_or_else(|| BlockError::TransactionError {
                    index,
                    source: TransactionError::InputsSpent(input.previous_output.to_string()),
                })?;
                prevouts.push(spent);
            }
            undo.tx_undo.push(TxUndo { prevouts });
        }

        view.add_tx_outputs(tx, ctx.height);
    }

    match (stake_claim, block.coinbase()) {
        (Some((claimed, coin_age)), _) => {
            let allowed = reward::stake_reward(coin_age, params).saturating_add(fees);
            if claimed > allowed {
                return Err(BlockError::TransactionError {
                    index: 1,
                    source: TransactionError::CoinstakeRewardTooHigh { claimed, allowed },
                }
                .into());
            }
        }
        (None, Some(coinbase)) => {
            let got = coinbase.total_output_value().unwrap_or(u64::MAX);
            let max = reward::block_subsidy(ctx.height, params).saturating_add(fees);
            if got > max {
                return Err(BlockError::CoinbaseTooHigh { got, max }.into());
            }
        }
        (None, None) => return Err(BlockError::NoTransactions.into()),
    }

    if hooks.is_spork_active(Spork::MasternodePaymentEnforcement) && !hooks.is_block_payee_valid(block, ctx.height) {
        return Err(BlockError::PayeeInvalid(ctx.height).into());
    }

    verifier.verify(&checks)?;

    view.set_best_block(hash);
    Ok(ConnectedBlock {
        undo,
        fees,
        value_in,
        value_out,
        proof_hash,
    })
}

/// Undo `block` on top of `view` using its undo record.
///
/// Any disagreement between the block, its undo data and the view is a
/// local corruption, not a consensus failure.
pub fn disconnect_block<V: CoinsView>(
    block: &Block,
    undo: &BlockUndo,
    view: &mut CoinsCache<V>,
) -> Result<(), FatalError> {
    let hash = block.hash();
    let spending = block.transactions.iter().filter(|tx| !tx.is_coinbase()).count();
    if undo.tx_undo.len() != spending {
        return Err(FatalError::UndoMismatch(hash.to_string()));
    }

    let mut tx_undo = undo.tx_undo.iter().rev();
    for tx in block.transactions.iter().rev() {
        let txid = tx.txid();
        if view.access_coins(&txid)?.is_none() && tx.outputs.iter().any(coins::is_spendable) {
            warn!(%txid, block = %hash, "outputs already gone while disconnecting");
        }
        view.set_coins(txid, None);

        if tx.is_coinbase() {
            continue;
        }
        let record = tx_undo.next().ok_or_else(|| FatalError::UndoMismatch(hash.to_string()))?;
        if record.prevouts.len() != tx.inputs.len() {
            return Err(FatalError::UndoMismatch(hash.to_string()));
        }
        for (input, spent) in tx.inputs.iter().zip(&record.prevouts).rev() {
            let prevout = input.previous_output;
            let slot = view.modify(&prevout.txid)?;
            let coins = slot.get_or_insert_with(|| spent.to_empty_coins());
            if !coins.restore(prevout.index, spent.output.clone()) {
                return Err(FatalError::UndoMismatch(hash.to_string()));
            }
        }
    }

    view.set_best_block(block.header.prev_hash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::coins::Coins;
    use strata_core::constants::COIN;
    use strata_core::crypto::{self, KeyPair};
    use strata_core::merkle;
    use strata_core::script;
    use strata_core::traits::NoopHooks;
    use strata_core::types::{BlockHeader, OutPoint, Transaction, TxInput, TxOutput};
    use strata_core::view::MemoryCoinsView;

    // --- Helpers ---

    const TIME: u32 = 1_700_100_000;
    const FEE: u64 = strata_core::constants::MIN_TX_FEE;

    fn coinbase(height: u32, value: u64, kp: &KeyPair) -> Transaction {
        let mut script_sig = script::encode_height(height);
        script_sig.push(0);
        Transaction {
            version: 1,
            time: TIME,
            inputs: vec![TxInput::new(OutPoint::null(), script_sig)],
            outputs: vec![TxOutput { value, script_pubkey: kp.locking_script() }],
            lock_time: 0,
        }
    }

    fn spend(prev: &Transaction, kp: &KeyPair, to: &KeyPair, fee: u64) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            time: TIME,
            inputs: vec![TxInput::new(OutPoint::new(prev.txid(), 0), vec![])],
            outputs: vec![TxOutput {
                value: prev.outputs[0].value - fee,
                script_pubkey: to.locking_script(),
            }],
            lock_time: 0,
        };
        crypto::sign_transaction_input(&mut tx, 0, kp).unwrap();
        tx
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256([0x42; 32]),
                merkle_root: merkle::merkle_root(&transactions.iter().map(Transaction::txid).collect::<Vec<_>>()),
                time: TIME,
                bits: ChainParams::regtest().pow_limit,
                nonce: 0,
            },
            transactions,
            signature: Vec::new(),
        }
    }

    /// A view holding one mature coinbase output owned by `kp`.
    fn funded(kp: &KeyPair) -> (CoinsCache<MemoryCoinsView>, Transaction) {
        let funding = coinbase(1, 50 * COIN, kp);
        let mut view = CoinsCache::new(MemoryCoinsView::new());
        view.add_tx_outputs(&funding, 1);
        (view, funding)
    }

    fn ctx(height: u32) -> ConnectContext {
        ConnectContext { height, stake_modifier: 0, verify_scripts: true }
    }

    // --- Connect ---

    #[test]
    fn connect_spends_and_creates() {
        let params = ChainParams::regtest();
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let (mut view, funding) = funded(&kp);
        let pay = spend(&funding, &kp, &kp, FEE);
        let b = block(vec![coinbase(20, 10 * COIN, &kp), pay.clone()]);

        let connected = connect_block(&b, &ctx(20), &mut view, &SigVerifier::default(), &NoopHooks, &params).unwrap();
        assert_eq!(connected.fees, FEE);
        assert_eq!(connected.value_in, 50 * COIN);
        assert_eq!(connected.undo.tx_undo.len(), 1);
        assert!(!view.have_output(&OutPoint::new(funding.txid(), 0)).unwrap());
        assert!(view.have_output(&OutPoint::new(pay.txid(), 0)).unwrap());
        assert_eq!(view.best_block().unwrap(), b.hash());
    }

    #[test]
    fn disconnect_restores_view_exactly() {
        let params = ChainParams::regtest();
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let (mut view, funding) = funded(&kp);
        let before: Coins = view.get_coins(&funding.txid()).unwrap().unwrap();

        let pay = spend(&funding, &kp, &kp, FEE);
        let b = block(vec![coinbase(20, COIN, &kp), pay.clone()]);
        let connected = connect_block(&b, &ctx(20), &mut view, &SigVerifier::new(2), &NoopHooks, &params).unwrap();

        disconnect_block(&b, &connected.undo, &mut view).unwrap();
        assert_eq!(view.get_coins(&funding.txid()).unwrap(), Some(before));
        assert_eq!(view.get_coins(&pay.txid()).unwrap(), None);
        assert_eq!(view.best_block().unwrap(), b.header.prev_hash);
    }

    #[test]
    fn intra_block_double_spend_rejected() {
        let params = ChainParams::regtest();
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let other = KeyPair::from_secret_bytes([2; 32]);
        let (mut view, funding) = funded(&kp);
        let a = spend(&funding, &kp, &kp, FEE);
        let b = spend(&funding, &kp, &other, FEE);
        let blk = block(vec![coinbase(20, COIN, &kp), a, b]);
        let err = connect_block(&blk, &ctx(20), &mut view, &SigVerifier::default(), &NoopHooks, &params).unwrap_err();
        assert!(matches!(
            err,
            StrataError::Block(BlockError::TransactionError { index: 2, source: TransactionError::MissingInputs(_) })
        ));
    }

    #[test]
    fn coinbase_cannot_exceed_subsidy_plus_fees() {
        let params = ChainParams::regtest();
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let (mut view, funding) = funded(&kp);
        let pay = spend(&funding, &kp, &kp, FEE);
        let subsidy = reward::block_subsidy(20, &params);
        let blk = block(vec![coinbase(20, subsidy + FEE + 1, &kp), pay]);
        let err = connect_block(&blk, &ctx(20), &mut view, &SigVerifier::default(), &NoopHooks, &params).unwrap_err();
        assert!(matches!(err, StrataError::Block(BlockError::CoinbaseTooHigh { .. })));
    }

    #[test]
    fn immature_coinbase_spend_rejected() {
        let params = ChainParams::regtest();
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let (mut view, funding) = funded(&kp);
        let pay = spend(&funding, &kp, &kp, FEE);
        let height = 1 + params.coinbase_maturity - 1;
        let blk = block(vec![coinbase(height, COIN, &kp), pay]);
        let err = connect_block(&blk, &ctx(height), &mut view, &SigVerifier::default(), &NoopHooks, &params).unwrap_err();
        assert!(matches!(
            err,
            StrataError::Block(BlockError::TransactionError { index: 1, source: TransactionError::ImmatureSpend { .. } })
        ));
    }

    #[test]
    fn bad_signature_found_by_verifier() {
        let params = ChainParams::regtest();
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let thief = KeyPair::from_secret_bytes([9; 32]);
        let (mut view, funding) = funded(&kp);
        let stolen = spend(&funding, &thief, &thief, FEE);
        let blk = block(vec![coinbase(20, COIN, &kp), stolen]);
        let err = connect_block(&blk, &ctx(20), &mut view, &SigVerifier::new(2), &NoopHooks, &params).unwrap_err();
        assert!(matches!(
            err,
            StrataError::Block(BlockError::TransactionError { index: 1, source: TransactionError::Script { .. } })
        ));

        let unchecked = ConnectContext { verify_scripts: false, ..ctx(20) };
        let (mut view, _) = funded(&kp);
        assert!(connect_block(&blk, &unchecked, &mut view, &SigVerifier::default(), &NoopHooks, &params).is_ok());
    }

    #[test]
    fn duplicate_unspent_txid_rejected() {
        let params = ChainParams::regtest();
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let (mut view, funding) = funded(&kp);
        let blk = block(vec![funding]);
        let err = connect_block(&blk, &ctx(1), &mut view, &SigVerifier::default(), &NoopHooks, &params).unwrap_err();
        assert!(matches!(err, StrataError::Block(BlockError::OverwritesUnspent(_))));
    }

    struct LockAll;

    impl ConsensusHooks for LockAll {
        fn tx_lock_conflict(&self, _tx: &Transaction) -> Option<Hash256> {
            Some(Hash256([0xAB; 32]))
        }

        fn is_block_payee_valid(&self, _block: &Block, _height: u32) -> bool {
            false
        }

        fn is_spork_active(&self, _spork: Spork) -> bool {
            true
        }
    }

    #[test]
    fn hooks_can_veto_blocks() {
        let params = ChainParams::regtest();
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let (mut view, funding) = funded(&kp);
        let pay = spend(&funding, &kp, &kp, FEE);
        let blk = block(vec![coinbase(20, COIN, &kp), pay]);
        let err = connect_block(&blk, &ctx(20), &mut view, &SigVerifier::default(), &LockAll, &params).unwrap_err();
        assert!(matches!(
            err,
            StrataError::Block(BlockError::TransactionError { source: TransactionError::LockConflict(_), .. })
        ));

        let (mut view, _) = funded(&kp);
        let empty = block(vec![coinbase(20, COIN, &kp)]);
        let err = connect_block(&empty, &ctx(20), &mut view, &SigVerifier::default(), &LockAll, &params).unwrap_err();
        assert!(matches!(err, StrataError::Block(BlockError::PayeeInvalid(20))));
    }

    #[test]
    fn disconnect_with_wrong_undo_is_fatal() {
        let params = ChainParams::regtest();
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let (mut view, funding) = funded(&kp);
        let pay = spend(&funding, &kp, &kp, FEE);
        let blk = block(vec![coinbase(20, COIN, &kp), pay]);
        connect_block(&blk, &ctx(20), &mut view, &SigVerifier::default(), &NoopHooks, &params).unwrap();
        assert!(matches!(
            disconnect_block(&blk, &BlockUndo::default(), &mut view),
            Err(FatalError::UndoMismatch(_))
        ));
    }
}
