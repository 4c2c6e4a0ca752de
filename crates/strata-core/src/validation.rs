//! Transaction validation.
//!
//! Two levels:
//!
//! - **Context-free** ([`check_transaction`]): format and internal
//!   consistency. No external state.
//! - **Inputs** ([`check_inputs`]): checks against a [`CoinsView`]. Missing
//!   parents, spent parents, maturity, input times, value ranges, the fee
//!   schedule and signatures.
//!
//! Signature checks can be collected as [`ScriptCheck`]s instead of run
//! inline, so a block's checks can be verified together on a thread pool.

use std::collections::HashSet;

use crate::coins::Coins;
use crate::constants::{
    BLOCK_RESERVED_SIZE, CURRENT_TX_VERSION, MAX_BLOCK_SIZE, MAX_MONEY, MAX_STANDARD_SCRIPT_SIG_SIZE,
    MAX_STANDARD_TX_SIZE, money_range,
};
use crate::crypto;
use crate::error::{MempoolError, StrataError, TransactionError};
use crate::fees::{FeeMode, min_fee};
use crate::kernel;
use crate::params::ChainParams;
use crate::script;
use crate::types::Transaction;
use crate::view::CoinsView;

/// Totals of a transaction whose inputs checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSummary {
    pub value_in: u64,
    pub value_out: u64,
    /// `value_in - value_out`; zero for a coinstake.
    pub fee: u64,
    /// Coin-days consumed. Only computed for a coinstake.
    pub coin_age: u64,
}

/// Fee requirement applied by [`check_inputs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRule {
    pub mode: FeeMode,
    pub block_size: usize,
    pub allow_free: bool,
}

impl FeeRule {
    /// The floor every transaction in a block must pay, priced as if it
    /// were the first after the header and coinbase.
    pub fn block() -> Self {
        Self {
            mode: FeeMode::Block,
            block_size: BLOCK_RESERVED_SIZE,
            allow_free: false,
        }
    }

    /// The floor for relaying loose transactions.
    pub fn relay(allow_free: bool) -> Self {
        Self {
            mode: FeeMode::Relay,
            block_size: 0,
            allow_free,
        }
    }
}

/// Where and how inputs are being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputContext {
    /// Height the spend would confirm at.
    pub spend_height: u32,
    /// `None` skips the fee floor.
    pub fee_rule: Option<FeeRule>,
    pub verify_scripts: bool,
}

/// One deferred signature check.
#[derive(Debug, Clone)]
pub struct ScriptCheck<'a> {
    pub tx: &'a Transaction,
    pub input: usize,
    pub locking_script: Vec<u8>,
}

impl ScriptCheck<'_> {
    pub fn verify(&self) -> Result<(), TransactionError> {
        crypto::verify_transaction_input(self.tx, self.input, &self.locking_script).map_err(
            |source| TransactionError::Script {
                index: self.input,
                source,
            },
        )
    }
}

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.inputs.is_empty() {
        return Err(TransactionError::EmptyInputs);
    }
    if tx.outputs.is_empty() {
        return Err(TransactionError::EmptyOutputs);
    }

    let size = tx.encoded_size();
    if size > MAX_BLOCK_SIZE {
        return Err(TransactionError::Oversized {
            size,
            max: MAX_BLOCK_SIZE,
        });
    }

    let reward_tx = tx.is_coinbase() || tx.is_coinstake();
    let mut total: u64 = 0;
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.is_empty() && !reward_tx {
            return Err(TransactionError::EmptyOutput(i));
        }
        if output.value > MAX_MONEY {
            return Err(TransactionError::OutputValueOutOfRange(i));
        }
        total = total
            .checked_add(output.value)
            .filter(|&t| money_range(t))
            .ok_or(TransactionError::OutputTotalOutOfRange)?;
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.previous_output) {
            return Err(TransactionError::DuplicateInput(input.previous_output.to_string()));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(TransactionError::BadCoinbaseLength(len));
        }
    } else if let Some(i) = tx.inputs.iter().position(|input| input.previous_output.is_null()) {
        return Err(TransactionError::NullPrevout(i));
    }

    Ok(())
}

/// Signature operations counted without looking at spent outputs.
pub fn legacy_sigop_count(tx: &Transaction) -> usize {
    let inputs: usize = tx.inputs.iter().map(|i| script::sigop_count(&i.script_sig)).sum();
    let outputs: usize = tx.outputs.iter().map(|o| script::sigop_count(&o.script_pubkey)).sum();
    inputs + outputs
}

/// Relay policy: transactions the pool is willing to carry.
pub fn check_standard(tx: &Transaction) -> Result<(), MempoolError> {
    if tx.version > CURRENT_TX_VERSION || tx.version == 0 {
        return Err(MempoolError::NonStandard("version".into()));
    }
    if tx.encoded_size() >= MAX_STANDARD_TX_SIZE {
        return Err(MempoolError::NonStandard("tx-size".into()));
    }
    if tx
        .inputs
        .iter()
        .any(|i| i.script_sig.len() > MAX_STANDARD_SCRIPT_SIG_SIZE)
    {
        return Err(MempoolError::NonStandard("scriptsig-size".into()));
    }
    if !tx.outputs.iter().all(|o| script::is_standard_locking(&o.script_pubkey)) {
        return Err(MempoolError::NonStandard("scriptpubkey".into()));
    }
    Ok(())
}

/// Check a non-coinbase transaction's inputs against `view`.
///
/// A parent with no record reports [`TransactionError::MissingInputs`]; a
/// parent whose record exists but whose output is gone reports
/// [`TransactionError::InputsSpent`]. Storage failures surface as fatal.
///
/// With `checks` supplied, signature checks are appended there for the
/// caller to run; otherwise they run inline.
pub fn check_inputs<'a, V: CoinsView + ?Sized>(
    tx: &'a Transaction,
    view: &mut V,
    ctx: &InputContext,
    params: &ChainParams,
    checks: Option<&mut Vec<ScriptCheck<'a>>>,
) -> Result<InputSummary, StrataError> {
    let mut parents: Vec<Coins> = Vec::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        let prevout = &input.previous_output;
        match view.get_coins(&prevout.txid)? {
            Some(coins) => parents.push(coins),
            None => return Err(TransactionError::MissingInputs(prevout.txid.to_string()).into()),
        }
    }

    let mut value_in: u64 = 0;
    let mut aged: Vec<(u64, u32)> = Vec::new();
    let mut pending = Vec::new();

    for (i, (input, coins)) in tx.inputs.iter().zip(&parents).enumerate() {
        let prevout = &input.previous_output;
        let Some(output) = coins.output(prevout.index) else {
            return Err(TransactionError::InputsSpent(prevout.to_string()).into());
        };

        if coins.is_reward() {
            let depth = ctx.spend_height.saturating_sub(coins.height);
            if depth < params.coinbase_maturity {
                return Err(TransactionError::ImmatureSpend {
                    index: i,
                    depth,
                    required: params.coinbase_maturity,
                }
                .into());
            }
        }

        if coins.time > tx.time {
            return Err(TransactionError::InputTimeTooLate { index: i }.into());
        }

        if !money_range(output.value) {
            return Err(TransactionError::InputValueOutOfRange.into());
        }
        value_in = value_in
            .checked_add(output.value)
            .filter(|&v| money_range(v))
            .ok_or(TransactionError::InputValueOutOfRange)?;

        if tx.is_coinstake() {
            aged.push((output.value, coins.time));
        }

        if ctx.verify_scripts {
            pending.push(ScriptCheck {
                tx,
                input: i,
                locking_script: output.script_pubkey.clone(),
            });
        }
    }

    let value_out = tx
        .total_output_value()
        .ok_or(TransactionError::OutputTotalOutOfRange)?;

    let (fee, coin_age) = if tx.is_coinstake() {
        (0, kernel::coin_age(&aged, tx.time, params))
    } else {
        if value_in < value_out {
            return Err(TransactionError::InputsBelowOutputs {
                input: value_in,
                output: value_out,
            }
            .into());
        }
        let fee = value_in - value_out;
        if let Some(rule) = ctx.fee_rule {
            let required = min_fee(tx, rule.block_size, rule.mode, rule.allow_free);
            if fee < required {
                return Err(TransactionError::FeeTooLow { fee, required }.into());
            }
        }
        (fee, 0)
    };

    match checks {
        Some(out) => out.extend(pending),
        None => {
            for check in &pending {
                check.verify()?;
            }
        }
    }

    Ok(InputSummary {
        value_in,
        value_out,
        fee,
        coin_age,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CENT, COIN, MEMPOOL_HEIGHT};
    use crate::crypto::KeyPair;
    use crate::error::ScriptError;
    use crate::types::{Hash256, OutPoint, TxInput, TxOutput};
    use crate::view::{CoinsCache, MemoryCoinsView};

    // --- Helpers ---

    fn funding_tx(kp: &KeyPair, value: u64, time: u32) -> Transaction {
        Transaction {
            version: 1,
            time,
            inputs: vec![TxInput::new(OutPoint::new(Hash256([0xF0; 32]), 0), vec![])],
            outputs: vec![TxOutput {
                value,
                script_pubkey: kp.locking_script(),
            }],
            lock_time: 0,
        }
    }

    fn spend(kp: &KeyPair, parent: &Transaction, value: u64, time: u32) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            time,
            inputs: vec![TxInput::new(OutPoint::new(parent.txid(), 0), vec![])],
            outputs: vec![TxOutput {
                value,
                script_pubkey: kp.locking_script(),
            }],
            lock_time: 0,
        };
        crypto::sign_transaction_input(&mut tx, 0, kp).unwrap();
        tx
    }

    fn view_with(txs: &[(&Transaction, u32)]) -> CoinsCache<MemoryCoinsView> {
        let mut cache = CoinsCache::new(MemoryCoinsView::new());
        for (tx, height) in txs {
            cache.add_tx_outputs(tx, *height);
        }
        cache
    }

    fn ctx(height: u32) -> InputContext {
        InputContext {
            spend_height: height,
            fee_rule: Some(FeeRule::block()),
            verify_scripts: true,
        }
    }

    fn coinbase(script_len: usize) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            inputs: vec![TxInput::new(OutPoint::null(), vec![1; script_len])],
            outputs: vec![TxOutput {
                value: COIN,
                script_pubkey: vec![0x76; 33],
            }],
            lock_time: 0,
        }
    }

    // --- check_transaction ---

    #[test]
    fn rejects_empty_inputs_and_outputs() {
        let mut tx = coinbase(2);
        tx.outputs.clear();
        assert_eq!(check_transaction(&tx), Err(TransactionError::EmptyOutputs));
        tx.inputs.clear();
        assert_eq!(check_transaction(&tx), Err(TransactionError::EmptyInputs));
    }

    #[test]
    fn rejects_duplicate_input() {
        let kp = KeyPair::generate();
        let parent = funding_tx(&kp, COIN, 0);
        let mut tx = spend(&kp, &parent, COIN / 2, 10);
        tx.inputs.push(tx.inputs[0].clone());
        assert!(matches!(check_transaction(&tx), Err(TransactionError::DuplicateInput(_))));
    }

    #[test]
    fn rejects_output_out_of_range() {
        let mut tx = coinbase(2);
        tx.outputs[0].value = MAX_MONEY + 1;
        assert_eq!(check_transaction(&tx), Err(TransactionError::OutputValueOutOfRange(0)));

        let mut tx = coinbase(2);
        tx.outputs[0].value = MAX_MONEY;
        tx.outputs.push(TxOutput {
            value: 1,
            script_pubkey: vec![0x76; 33],
        });
        assert_eq!(check_transaction(&tx), Err(TransactionError::OutputTotalOutOfRange));
    }

    #[test]
    fn coinbase_script_length_bounds() {
        assert!(check_transaction(&coinbase(2)).is_ok());
        assert!(check_transaction(&coinbase(100)).is_ok());
        assert_eq!(check_transaction(&coinbase(1)), Err(TransactionError::BadCoinbaseLength(1)));
        assert_eq!(
            check_transaction(&coinbase(101)),
            Err(TransactionError::BadCoinbaseLength(101))
        );
    }

    #[test]
    fn empty_output_only_in_reward_transactions() {
        let kp = KeyPair::generate();
        let parent = funding_tx(&kp, COIN, 0);
        let mut tx = spend(&kp, &parent, COIN / 2, 10);
        tx.outputs.push(TxOutput::empty());
        assert_eq!(check_transaction(&tx), Err(TransactionError::EmptyOutput(1)));

        // Marker first makes it a coinstake.
        tx.outputs.rotate_right(1);
        assert!(tx.is_coinstake());
        assert!(check_transaction(&tx).is_ok());
    }

    #[test]
    fn null_prevout_outside_coinbase() {
        let mut tx = coinbase(2);
        tx.inputs.push(TxInput::new(OutPoint::new(Hash256([3; 32]), 0), vec![]));
        assert_eq!(check_transaction(&tx), Err(TransactionError::NullPrevout(0)));
    }

    // --- check_inputs ---

    #[test]
    fn valid_spend_reports_fee() {
        let kp = KeyPair::generate();
        let parent = funding_tx(&kp, 10 * COIN, 100);
        let tx = spend(&kp, &parent, 10 * COIN - CENT, 200);
        let mut view = view_with(&[(&parent, 1)]);
        let params = ChainParams::regtest();

        let summary = check_inputs(&tx, &mut view, &ctx(2), &params, None).unwrap();
        assert_eq!(summary.fee, CENT);
        assert_eq!(summary.value_in, 10 * COIN);
        // Unchanged view, same answer.
        assert_eq!(check_inputs(&tx, &mut view, &ctx(2), &params, None).unwrap(), summary);
    }

    #[test]
    fn missing_parent_is_missing_dependency() {
        let kp = KeyPair::generate();
        let parent = funding_tx(&kp, COIN, 0);
        let tx = spend(&kp, &parent, COIN / 2, 10);
        let mut view = view_with(&[]);
        let err = check_inputs(&tx, &mut view, &ctx(5), &ChainParams::regtest(), None).unwrap_err();
        assert!(err.is_missing_dependency());
    }

    #[test]
    fn spent_output_is_invalid() {
        let kp = KeyPair::generate();
        let mut parent = funding_tx(&kp, COIN, 0);
        parent.outputs.push(parent.outputs[0].clone());
        let tx = spend(&kp, &parent, COIN / 2, 10);
        let mut view = view_with(&[(&parent, 1)]);
        view.spend(&OutPoint::new(parent.txid(), 0)).unwrap();
        let err = check_inputs(&tx, &mut view, &ctx(5), &ChainParams::regtest(), None).unwrap_err();
        assert!(matches!(err, StrataError::Transaction(TransactionError::InputsSpent(_))));
    }

    #[test]
    fn maturity_boundary() {
        let kp = KeyPair::generate();
        let params = ChainParams::regtest();
        let mut reward = coinbase(2);
        reward.outputs[0].script_pubkey = kp.locking_script();
        let tx = spend(&kp, &reward, COIN - CENT, 10);
        let mut view = view_with(&[(&reward, 5)]);

        let below = 5 + params.coinbase_maturity - 1;
        let err = check_inputs(&tx, &mut view, &ctx(below), &params, None).unwrap_err();
        assert!(matches!(
            err,
            StrataError::Transaction(TransactionError::ImmatureSpend { index: 0, .. })
        ));
        let exact = 5 + params.coinbase_maturity;
        assert!(check_inputs(&tx, &mut view, &ctx(exact), &params, None).is_ok());
    }

    #[test]
    fn input_newer_than_spend_rejected() {
        let kp = KeyPair::generate();
        let parent = funding_tx(&kp, COIN, 500);
        let tx = spend(&kp, &parent, COIN - CENT, 499);
        let mut view = view_with(&[(&parent, 1)]);
        let err = check_inputs(&tx, &mut view, &ctx(2), &ChainParams::regtest(), None).unwrap_err();
        assert_eq!(err, TransactionError::InputTimeTooLate { index: 0 }.into());
    }

    #[test]
    fn outputs_above_inputs_rejected() {
        let kp = KeyPair::generate();
        let parent = funding_tx(&kp, COIN, 0);
        let tx = spend(&kp, &parent, COIN + 1, 10);
        let mut view = view_with(&[(&parent, 1)]);
        let err = check_inputs(&tx, &mut view, &ctx(2), &ChainParams::regtest(), None).unwrap_err();
        assert!(matches!(
            err,
            StrataError::Transaction(TransactionError::InputsBelowOutputs { .. })
        ));
    }

    #[test]
    fn fee_below_schedule_rejected() {
        let kp = KeyPair::generate();
        let parent = funding_tx(&kp, COIN, 0);
        let tx = spend(&kp, &parent, COIN - 1, 10);
        let mut view = view_with(&[(&parent, 1)]);
        let err = check_inputs(&tx, &mut view, &ctx(2), &ChainParams::regtest(), None).unwrap_err();
        assert!(matches!(err, StrataError::Transaction(TransactionError::FeeTooLow { fee: 1, .. })));

        let no_fee_rule = InputContext {
            fee_rule: None,
            ..ctx(2)
        };
        assert!(check_inputs(&tx, &mut view, &no_fee_rule, &ChainParams::regtest(), None).is_ok());
    }

    #[test]
    fn wrong_key_fails_signature() {
        let owner = KeyPair::generate();
        let thief = KeyPair::generate();
        let parent = funding_tx(&owner, COIN, 0);
        let tx = spend(&thief, &parent, COIN - CENT, 10);
        let mut view = view_with(&[(&parent, 1)]);
        let err = check_inputs(&tx, &mut view, &ctx(2), &ChainParams::regtest(), None).unwrap_err();
        assert_eq!(
            err,
            TransactionError::Script {
                index: 0,
                source: ScriptError::Crypto(crate::error::CryptoError::PubkeyHashMismatch),
            }
            .into()
        );

        let skip = InputContext {
            verify_scripts: false,
            ..ctx(2)
        };
        assert!(check_inputs(&tx, &mut view, &skip, &ChainParams::regtest(), None).is_ok());
    }

    #[test]
    fn collected_checks_defer_verification() {
        let owner = KeyPair::generate();
        let thief = KeyPair::generate();
        let parent = funding_tx(&owner, COIN, 0);
        let tx = spend(&thief, &parent, COIN - CENT, 10);
        let mut view = view_with(&[(&parent, 1)]);
        let mut checks = Vec::new();
        check_inputs(&tx, &mut view, &ctx(2), &ChainParams::regtest(), Some(&mut checks)).unwrap();
        assert_eq!(checks.len(), 1);
        assert!(checks[0].verify().is_err());
    }

    #[test]
    fn coinstake_reports_coin_age_not_fee() {
        let kp = KeyPair::generate();
        let params = ChainParams::regtest();
        let day = 24 * 3600;
        let parent = funding_tx(&kp, 10 * COIN, 0);
        let mut stake = spend(&kp, &parent, 11 * COIN, 3 * day);
        stake.outputs.insert(0, TxOutput::empty());
        crypto::sign_transaction_input(&mut stake, 0, &kp).unwrap();
        let mut view = view_with(&[(&parent, 1)]);

        let summary = check_inputs(&stake, &mut view, &ctx(50), &params, None).unwrap();
        assert_eq!(summary.fee, 0);
        assert_eq!(summary.coin_age, 30);
        assert_eq!(summary.value_out, 11 * COIN);
    }

    // --- Standardness ---

    #[test]
    fn standardness_rules() {
        let kp = KeyPair::generate();
        let parent = funding_tx(&kp, COIN, 0);
        let tx = spend(&kp, &parent, COIN - CENT, 10);
        assert!(check_standard(&tx).is_ok());

        let mut bad = tx.clone();
        bad.version = CURRENT_TX_VERSION + 1;
        assert!(check_standard(&bad).is_err());

        let mut bad = tx.clone();
        bad.outputs[0].script_pubkey = vec![0x51];
        assert!(check_standard(&bad).is_err());

        let mut bad = tx;
        bad.inputs[0].script_sig = vec![0; MAX_STANDARD_SCRIPT_SIG_SIZE + 1];
        assert!(check_standard(&bad).is_err());
    }

    #[test]
    fn pool_height_coins_are_not_rewards() {
        let kp = KeyPair::generate();
        let parent = funding_tx(&kp, COIN, 0);
        let tx = spend(&kp, &parent, COIN - CENT, 10);
        let mut view = view_with(&[(&parent, MEMPOOL_HEIGHT)]);
        assert!(check_inputs(&tx, &mut view, &ctx(MEMPOOL_HEIGHT), &ChainParams::regtest(), None).is_ok());
    }

    #[test]
    fn legacy_sigops_count_outputs() {
        let kp = KeyPair::generate();
        let parent = funding_tx(&kp, COIN, 0);
        let tx = spend(&kp, &parent, COIN - CENT, 10);
        assert_eq!(legacy_sigop_count(&tx), 1);
    }
}
