//! Per-transaction unspent output records and undo data.
//!
//! A [`Coins`] record holds what is left unspent of one transaction's
//! outputs. Spent slots become `None`; a record with no remaining outputs is
//! pruned. Outputs that can never be spent (the coinstake marker and
//! `OP_RETURN` scripts) never enter a record. Spending returns a [`TxInUndo`] carrying the spent output and the
//! metadata of its origin, enough to restore the record exactly.

use serde::{Deserialize, Serialize};

use crate::script::{self, ScriptKind};
use crate::types::{Transaction, TxOutput};

/// Unspent outputs of one transaction plus origin metadata.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Coins {
    /// Output slots indexed by output position. `None` once spent.
    pub outputs: Vec<Option<TxOutput>>,
    /// Height of the block containing the transaction.
    pub height: u32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
    pub version: u32,
    /// Transaction time; coin age is measured from it.
    pub time: u32,
}

impl Coins {
    pub fn from_tx(tx: &Transaction, height: u32) -> Self {
        let mut coins = Self {
            outputs: tx
                .outputs
                .iter()
                .map(|o| is_spendable(o).then(|| o.clone()))
                .collect(),
            height,
            is_coinbase: tx.is_coinbase(),
            is_coinstake: tx.is_coinstake(),
            version: tx.version,
            time: tx.time,
        };
        coins.trim();
        coins
    }

    pub fn output(&self, index: u32) -> Option<&TxOutput> {
        self.outputs.get(index as usize).and_then(Option::as_ref)
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.output(index).is_some()
    }

    /// Spend one output. Returns `None` if it was absent or already spent.
    pub fn spend(&mut self, index: u32) -> Option<TxInUndo> {
        let output = self.outputs.get_mut(index as usize)?.take()?;
        let undo = TxInUndo {
            output,
            height: self.height,
            is_coinbase: self.is_coinbase,
            is_coinstake: self.is_coinstake,
            version: self.version,
            time: self.time,
        };
        self.trim();
        Some(undo)
    }

    /// Whether every output has been spent.
    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    /// Whether outputs from a coinbase or coinstake are still maturing.
    pub fn is_reward(&self) -> bool {
        self.is_coinbase || self.is_coinstake
    }

    /// Restore a spent output from undo data.
    ///
    /// Returns false when the slot is already occupied.
    pub fn restore(&mut self, index: u32, output: TxOutput) -> bool {
        let index = index as usize;
        if self.outputs.len() <= index {
            self.outputs.resize(index + 1, None);
        }
        if self.outputs[index].is_some() {
            return false;
        }
        self.outputs[index] = Some(output);
        true
    }

    /// Rough heap usage, for cache sizing.
    pub fn dynamic_usage(&self) -> usize {
        self.outputs
            .iter()
            .map(|o| {
                std::mem::size_of::<Option<TxOutput>>()
                    + o.as_ref().map_or(0, |o| o.script_pubkey.capacity())
            })
            .sum()
    }

    fn trim(&mut self) {
        while matches!(self.outputs.last(), Some(None)) {
            self.outputs.pop();
        }
    }
}

/// Whether `output` could ever be spent.
pub fn is_spendable(output: &TxOutput) -> bool {
    !output.is_empty() && script::classify(&output.script_pubkey) != ScriptKind::Unspendable
}

/// Undo record for one spent input.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInUndo {
    pub output: TxOutput,
    pub height: u32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
    pub version: u32,
    pub time: u32,
}

impl TxInUndo {
    /// A fresh record holding only the restored output's metadata.
    pub fn to_empty_coins(&self) -> Coins {
        Coins {
            outputs: Vec::new(),
            height: self.height,
            is_coinbase: self.is_coinbase,
            is_coinstake: self.is_coinstake,
            version: self.version,
            time: self.time,
        }
    }
}

/// Undo records for all inputs of one transaction, in input order.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxUndo {
    pub prevouts: Vec<TxInUndo>,
}

/// Undo data for one block: one [`TxUndo`] per non-coinbase transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockUndo {
    pub tx_undo: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(bytes, bincode::config::standard()).map(|(undo, _)| undo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;
    use crate::types::{Hash256, OutPoint, TxInput};

    fn tx(outputs: usize) -> Transaction {
        Transaction {
            version: 1,
            time: 1_000,
            inputs: vec![TxInput::new(OutPoint::new(Hash256([1; 32]), 0), vec![])],
            outputs: (0..outputs)
                .map(|i| TxOutput {
                    value: (i as u64 + 1) * COIN,
                    script_pubkey: vec![0x76; 33],
                })
                .collect(),
            lock_time: 0,
        }
    }

    #[test]
    fn spend_returns_undo_and_prunes() {
        let mut coins = Coins::from_tx(&tx(2), 7);
        assert!(coins.is_available(1));

        let undo = coins.spend(1).unwrap();
        assert_eq!(undo.output.value, 2 * COIN);
        assert_eq!(undo.height, 7);
        assert!(!coins.is_available(1));
        assert!(coins.spend(1).is_none());
        assert!(!coins.is_pruned());

        coins.spend(0).unwrap();
        assert!(coins.is_pruned());
        assert!(coins.outputs.is_empty());
    }

    #[test]
    fn restore_refuses_occupied_slot() {
        let mut coins = Coins::from_tx(&tx(3), 1);
        let undo = coins.spend(2).unwrap();
        assert!(coins.restore(2, undo.output.clone()));
        assert!(!coins.restore(2, undo.output));
        assert_eq!(coins, Coins::from_tx(&tx(3), 1));
    }

    #[test]
    fn restore_into_empty_record() {
        let mut coins = Coins::from_tx(&tx(1), 4);
        let undo = coins.spend(0).unwrap();
        let mut fresh = undo.to_empty_coins();
        assert!(fresh.restore(0, undo.output));
        assert_eq!(fresh, Coins::from_tx(&tx(1), 4));
    }

    #[test]
    fn unspendable_outputs_never_enter_the_record() {
        let mut coinstake = tx(2);
        coinstake.outputs.insert(0, TxOutput::empty());
        let coins = Coins::from_tx(&coinstake, 9);
        assert!(coins.is_coinstake);
        assert!(!coins.is_available(0));
        assert_eq!(coins.output(1).map(|o| o.value), Some(COIN));

        let mut burn = tx(1);
        burn.outputs.push(TxOutput {
            value: COIN,
            script_pubkey: script::unspendable(b"burn"),
        });
        let coins = Coins::from_tx(&burn, 9);
        assert_eq!(coins.outputs.len(), 1);

        burn.outputs.remove(0);
        assert!(Coins::from_tx(&burn, 9).is_pruned());
    }

    #[test]
    fn block_undo_bincode_roundtrip() {
        let mut coins = Coins::from_tx(&tx(1), 3);
        let undo = BlockUndo {
            tx_undo: vec![TxUndo {
                prevouts: vec![coins.spend(0).unwrap()],
            }],
        };
        let bytes = undo.encode().unwrap();
        assert_eq!(BlockUndo::decode(&bytes).unwrap(), undo);
    }
}
