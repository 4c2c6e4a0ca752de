//! Notifications emitted by the chain state machine.
//!
//! Listeners are called synchronously while the chain state is borrowed, so
//! they must not block; the node's listener just forwards into a channel.

use strata_core::types::{Hash256, Transaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// The active tip moved.
    BestChainChanged {
        locator: Vec<Hash256>,
        height: u32,
        hash: Hash256,
    },
    /// A transaction entered the pool.
    TransactionAccepted {
        tx: Transaction,
        fee: u64,
        size: usize,
    },
    /// A pool transaction was dropped because a connected block spent one
    /// of its inputs.
    TransactionConflicted { tx: Transaction },
    /// A transaction was included in a newly connected block.
    TransactionConfirmed { txid: Hash256, height: u32 },
}

pub trait ChainListener: Send {
    fn on_event(&self, event: &ChainEvent);
}

impl<F> ChainListener for F
where
    F: Fn(&ChainEvent) + Send,
{
    fn on_event(&self, event: &ChainEvent) {
        self(event)
    }
}
