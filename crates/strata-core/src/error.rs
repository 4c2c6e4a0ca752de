//! Error types for the Strata protocol.
//!
//! Rejections carry an [`ErrorKind`] and a misbehavior score so the caller can
//! tell a permanently invalid object from one that is merely waiting on a
//! dependency, and both from a local failure that must halt the engine.
use thiserror::Error;

/// Disposition of a failed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid on its own; never reconsidered.
    StructuralInvalid,
    /// Invalid against the chain it was checked on; never reconsidered there.
    ContextualInvalid,
    /// Depends on data not yet known; may succeed later.
    MissingDependency,
    /// Local storage or memory failure. Mutation stops.
    ResourceExhaustion,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("pubkey hash does not match expected")] PubkeyHashMismatch,
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("output is provably unspendable")] Unspendable,
    #[error("unsupported locking script")] UnsupportedLockingScript,
    #[error("malformed unlocking script")] MalformedUnlockingScript,
    #[error(transparent)] Crypto(#[from] CryptoError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("no inputs")] EmptyInputs,
    #[error("no outputs")] EmptyOutputs,
    #[error("oversized: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("output {0} value out of range")] OutputValueOutOfRange(usize),
    #[error("output total out of range")] OutputTotalOutOfRange,
    #[error("empty output {0} in non-coinstake transaction")] EmptyOutput(usize),
    #[error("duplicate input: {0}")] DuplicateInput(String),
    #[error("coinbase script length {0} outside 2..=100")] BadCoinbaseLength(usize),
    #[error("null outpoint in non-coinbase input {0}")] NullPrevout(usize),
    #[error("missing inputs: {0}")] MissingInputs(String),
    #[error("input already spent: {0}")] InputsSpent(String),
    #[error("input {index} spends immature output: depth {depth} < {required}")] ImmatureSpend { index: usize, depth: u32, required: u32 },
    #[error("input {index} is newer than the spending transaction")] InputTimeTooLate { index: usize },
    #[error("input value out of range")] InputValueOutOfRange,
    #[error("inputs {input} below outputs {output}")] InputsBelowOutputs { input: u64, output: u64 },
    #[error("fee {fee} below required {required}")] FeeTooLow { fee: u64, required: u64 },
    #[error("coinstake reward {claimed} exceeds allowed {allowed}")] CoinstakeRewardTooHigh { claimed: u64, allowed: u64 },
    #[error("script failure on input {index}: {source}")] Script { index: usize, source: ScriptError },
    #[error("transaction is not final")] NonFinal,
    #[error("too many sigops: {count} > {max}")] TooManySigops { count: usize, max: usize },
    #[error("conflicts with locked transaction {0}")] LockConflict(String),
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyInputs
            | Self::EmptyOutputs
            | Self::Oversized { .. }
            | Self::OutputValueOutOfRange(_)
            | Self::OutputTotalOutOfRange
            | Self::EmptyOutput(_)
            | Self::DuplicateInput(_)
            | Self::BadCoinbaseLength(_)
            | Self::NullPrevout(_) => ErrorKind::StructuralInvalid,
            Self::MissingInputs(_) => ErrorKind::MissingDependency,
            _ => ErrorKind::ContextualInvalid,
        }
    }

    /// Soft score for the network layer's own banning policy.
    pub fn misbehavior(&self) -> u32 {
        match self {
            Self::MissingInputs(_)
            | Self::InputsSpent(_)
            | Self::NonFinal
            | Self::FeeTooLow { .. }
            | Self::TooManySigops { .. }
            | Self::LockConflict(_) => 0,
            Self::Oversized { .. } | Self::ImmatureSpend { .. } => 10,
            _ => 100,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("hash does not meet target")] ProofOfWorkFailed,
    #[error("invalid compact target {0:#010x}")] BadCompact(u32),
    #[error("target {0:#010x} above network limit")] TargetAboveLimit(u32),
    #[error("oversized: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("block has no transactions")] NoTransactions,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("coinstake at index {0}")] CoinstakeMisplaced(usize),
    #[error("proof-of-stake coinbase pays out")] StakeCoinbaseNotEmpty,
    #[error("transaction {0} is newer than the block")] TxTimeAfterBlock(usize),
    #[error("coinstake time differs from block time")] CoinstakeTimeMismatch,
    #[error("invalid merkle root")] MerkleMismatch,
    #[error("duplicate txid: {0}")] DuplicateTxid(String),
    #[error("too many sigops: {count} > {max}")] TooManySigops { count: usize, max: usize },
    #[error("missing block signature")] MissingSignature,
    #[error("unexpected signature on proof-of-work block")] UnexpectedSignature,
    #[error("bad block signature")] BadSignature,
    #[error("incorrect difficulty: got {got:#010x}, expected {expected:#010x}")] BadDifficulty { got: u32, expected: u32 },
    #[error("time {time} not after median time past {median}")] TimeTooOld { time: u32, median: u32 },
    #[error("time {time} too far in the future (max {max})")] TimeTooNew { time: u32, max: u64 },
    #[error("unsupported block version {0}")] BadVersion(u32),
    #[error("proof-of-work block at height {0} after last PoW height")] PowAfterLastPowHeight(u32),
    #[error("proof-of-stake block at height {0} before first PoS height")] StakeBeforeStart(u32),
    #[error("non-final transaction at index {0}")] NonFinalTx(usize),
    #[error("coinbase does not commit to height {0}")] BadCoinbaseHeight(u32),
    #[error("checkpoint mismatch at height {0}")] CheckpointMismatch(u32),
    #[error("fork at height {height} below checkpoint {checkpoint}")] ForkBelowCheckpoint { height: u32, checkpoint: u32 },
    #[error("duplicate stake {0}")] DuplicateStake(String),
    #[error("stake input age {age}s below minimum {min}s")] StakeTooYoung { age: u64, min: u64 },
    #[error("stake input not found: {0}")] StakeInputMissing(String),
    #[error("kernel hash above weighted target")] KernelHashTooHigh,
    #[error("masternode payee invalid at height {0}")] PayeeInvalid(u32),
    #[error("transaction overwrites unspent outputs: {0}")] OverwritesUnspent(String),
    #[error("coinbase pays {got}, max {max}")] CoinbaseTooHigh { got: u64, max: u64 },
    #[error("money supply out of range")] SupplyOutOfRange,
    #[error("unknown parent {0}")] OrphanBlock(String),
    #[error("parent {0} is invalid")] PrevInvalid(String),
    #[error("block {0} already marked invalid")] KnownInvalid(String),
    #[error("unknown block {0}")] UnknownBlock(String),
    #[error("tx error in {index}: {source}")] TransactionError { index: usize, source: TransactionError },
}

impl BlockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProofOfWorkFailed
            | Self::BadCompact(_)
            | Self::TargetAboveLimit(_)
            | Self::Oversized { .. }
            | Self::NoTransactions
            | Self::FirstTxNotCoinbase
            | Self::MultipleCoinbase
            | Self::CoinstakeMisplaced(_)
            | Self::StakeCoinbaseNotEmpty
            | Self::TxTimeAfterBlock(_)
            | Self::CoinstakeTimeMismatch
            | Self::MerkleMismatch
            | Self::DuplicateTxid(_)
            | Self::TooManySigops { .. }
            | Self::MissingSignature
            | Self::UnexpectedSignature => ErrorKind::StructuralInvalid,
            Self::OrphanBlock(_) => ErrorKind::MissingDependency,
            Self::TransactionError { source, .. } => match source.kind() {
                ErrorKind::StructuralInvalid => ErrorKind::StructuralInvalid,
                _ => ErrorKind::ContextualInvalid,
            },
            _ => ErrorKind::ContextualInvalid,
        }
    }

    pub fn misbehavior(&self) -> u32 {
        match self {
            Self::OrphanBlock(_)
            | Self::KnownInvalid(_)
            | Self::UnknownBlock(_)
            | Self::DuplicateStake(_)
            | Self::TimeTooNew { .. }
            | Self::PayeeInvalid(_) => 0,
            Self::TransactionError { source: TransactionError::LockConflict(_), .. } => 0,
            Self::BadDifficulty { .. } | Self::BadVersion(_) => 50,
            _ => 100,
        }
    }

    /// Whether the block itself is at fault, as opposed to arriving too early.
    ///
    /// Only such failures mark the index entry failed.
    pub fn marks_failed(&self) -> bool {
        !matches!(
            self,
            Self::OrphanBlock(_)
                | Self::KnownInvalid(_)
                | Self::UnknownBlock(_)
                | Self::TimeTooNew { .. }
                | Self::DuplicateStake(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("transaction already confirmed: {0}")] AlreadyConfirmed(String),
    #[error("conflicts with pool tx {existing_txid} on outpoint {outpoint}")] Conflict { new_txid: String, existing_txid: String, outpoint: String },
    #[error("coinbase or coinstake as loose transaction")] CoinbaseNotAllowed,
    #[error("non-standard: {0}")] NonStandard(String),
    #[error("fee {fee} below relay minimum {minimum}")] FeeTooLow { fee: u64, minimum: u64 },
    #[error("free transaction rejected by rate limiter")] RateLimited,
    #[error("orphan too large: {size} > {max}")] OrphanTooLarge { size: usize, max: usize },
    #[error("pool full")] PoolFull,
}

impl MempoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CoinbaseNotAllowed => ErrorKind::StructuralInvalid,
            _ => ErrorKind::ContextualInvalid,
        }
    }

    pub fn misbehavior(&self) -> u32 {
        match self {
            Self::CoinbaseNotAllowed => 100,
            _ => 0,
        }
    }
}

/// Failures of the local node rather than of the data it was given.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("storage: {0}")] Storage(String),
    #[error("database corruption: {0} (restart with --reindex)")] Corruption(String),
    #[error("undo data missing for block {0}")] MissingUndo(String),
    #[error("undo data inconsistent for block {0}")] UndoMismatch(String),
    #[error("block data missing for {0}")] MissingBlockData(String),
    #[error("view is read-only")] ReadOnlyView,
    #[error("engine halted: {0}")] Halted(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrataError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] Fatal(#[from] FatalError),
}

impl StrataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transaction(e) => e.kind(),
            Self::Block(e) => e.kind(),
            Self::Mempool(e) => e.kind(),
            Self::Fatal(_) => ErrorKind::ResourceExhaustion,
        }
    }

    pub fn misbehavior(&self) -> u32 {
        match self {
            Self::Transaction(e) => e.misbehavior(),
            Self::Block(e) => e.misbehavior(),
            Self::Mempool(e) => e.misbehavior(),
            Self::Fatal(_) => 0,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn is_missing_dependency(&self) -> bool {
        self.kind() == ErrorKind::MissingDependency
    }
}
