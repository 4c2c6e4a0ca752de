//! Block index and chain selection.
//!
//! Every header the node has seen lives in an arena of [`BlockIndexEntry`]s
//! addressed by [`BlockId`]. Entries form a tree rooted at genesis; each one
//! keeps its parent, a skip pointer for logarithmic ancestor lookup, and the
//! cumulative trust of the path leading to it.
//!
//! Chain selection works on a candidate set: entries whose body and every
//! ancestor's body are stored, ordered by trust (descending), then arrival
//! sequence (ascending), then hash. The first candidate whose path back to
//! the active chain is clean is the one the chain state machine tries next.
//!
//! # Status
//!
//! Validity tiers only move up. `FAILED_VALID` (the block itself broke a
//! rule) and `FAILED_CHILD` (an ancestor did) are sticky until an explicit
//! reconsider.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use primitive_types::U256;
use tracing::{debug, warn};

use strata_core::constants::MEDIAN_TIME_SPAN;
use strata_core::difficulty::{self, RetargetSample};
use strata_core::error::{BlockError, FatalError};
use strata_core::kernel;
use strata_core::params::ChainParams;
use strata_core::traits::{DiskIndexEntry, DiskPos};
use strata_core::types::{BlockHeader, Hash256, OutPoint};

/// Handle of an entry in the index arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How far a block has been validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Validity {
    Unknown = 0,
    /// Header parsed and proof checked.
    Header = 1,
    /// Parent known; trust and height computed.
    Tree = 2,
    /// Body stored and context-free checks passed.
    Transactions = 3,
    /// Contextual checks passed.
    Chain = 4,
    /// Connected: inputs and signatures verified.
    Scripts = 5,
}

impl Validity {
    fn from_bits(bits: u32) -> Self {
        match bits & BlockStatus::VALIDITY_MASK {
            1 => Self::Header,
            2 => Self::Tree,
            3 => Self::Transactions,
            4 => Self::Chain,
            5 => Self::Scripts,
            _ => Self::Unknown,
        }
    }
}

/// Status flags of an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStatus(u32);

impl BlockStatus {
    pub const VALIDITY_MASK: u32 = 7;
    pub const HAVE_DATA: u32 = 8;
    pub const HAVE_UNDO: u32 = 16;
    pub const FAILED_VALID: u32 = 32;
    pub const FAILED_CHILD: u32 = 64;
    pub const FAILED_MASK: u32 = Self::FAILED_VALID | Self::FAILED_CHILD;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn validity(self) -> Validity {
        Validity::from_bits(self.0)
    }

    /// Whether the entry reached `tier` and has not failed.
    pub fn is_valid(self, tier: Validity) -> bool {
        !self.is_failed() && self.validity() >= tier
    }

    pub fn has_data(self) -> bool {
        self.0 & Self::HAVE_DATA != 0
    }

    pub fn has_undo(self) -> bool {
        self.0 & Self::HAVE_UNDO != 0
    }

    pub fn is_failed(self) -> bool {
        self.0 & Self::FAILED_MASK != 0
    }

    fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    fn set_validity(&mut self, tier: Validity) {
        self.0 = (self.0 & !Self::VALIDITY_MASK) | tier as u32;
    }
}

/// One block the node knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: u32,
    /// Sum of block proofs from genesis through this block.
    pub trust: U256,
    pub status: BlockStatus,
    pub prev: Option<BlockId>,
    pub skip: Option<BlockId>,
    /// Successor on the active chain, if this entry is on it.
    pub next: Option<BlockId>,
    pub block_pos: Option<DiskPos>,
    pub undo_pos: Option<DiskPos>,
    pub tx_count: u32,
    /// Transactions from genesis through this block; zero while any
    /// ancestor's body is missing.
    pub chain_tx: u64,
    /// Order in which the body became connectable. Earlier wins trust ties.
    pub sequence_id: u64,
    pub money_supply: u64,
    pub mint: u64,
    pub is_proof_of_stake: bool,
    pub entropy_bit: u8,
    pub stake_modifier: u64,
    pub generated_modifier: bool,
    pub stake_source: Option<(OutPoint, u32)>,
    /// Block hash for proof-of-work, kernel hash for proof-of-stake.
    pub proof_hash: Hash256,
}

impl BlockIndexEntry {
    fn to_disk(&self) -> DiskIndexEntry {
        DiskIndexEntry {
            hash: self.hash,
            header: self.header.clone(),
            height: self.height,
            status: self.status.bits(),
            block_pos: self.block_pos,
            undo_pos: self.undo_pos,
            tx_count: self.tx_count,
            money_supply: self.money_supply,
            mint: self.mint,
            is_proof_of_stake: self.is_proof_of_stake,
            entropy_bit: self.entropy_bit,
            stake_modifier: self.stake_modifier,
            generated_modifier: self.generated_modifier,
            stake_source: self.stake_source,
            proof_hash: self.proof_hash,
        }
    }

    fn sample(&self) -> RetargetSample {
        RetargetSample {
            time: self.header.time,
            bits: self.header.bits,
        }
    }
}

/// Candidate ordering: highest trust first, then earliest arrival, then hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CandidateKey {
    trust: Reverse<U256>,
    sequence: u64,
    hash: Hash256,
    id: BlockId,
}

// --- Active chain ---

/// Root-to-tip path of the currently selected chain, indexed by height.
#[derive(Debug, Default, Clone)]
pub struct ActiveChain {
    ids: Vec<BlockId>,
}

impl ActiveChain {
    pub fn tip(&self) -> Option<BlockId> {
        self.ids.last().copied()
    }

    pub fn genesis(&self) -> Option<BlockId> {
        self.ids.first().copied()
    }

    /// Height of the tip, or `None` before genesis is connected.
    pub fn height(&self) -> Option<u32> {
        self.ids.len().checked_sub(1).map(|h| h as u32)
    }

    pub fn at_height(&self, height: u32) -> Option<BlockId> {
        self.ids.get(height as usize).copied()
    }

    pub fn contains(&self, id: BlockId, height: u32) -> bool {
        self.at_height(height) == Some(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// --- Skip list ---

fn invert_lowest_one(n: i64) -> i64 {
    n & (n - 1)
}

/// Height the skip pointer of an entry at `height` points to.
fn skip_height(height: i64) -> i64 {
    if height < 2 {
        return 0;
    }
    if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

// --- Index ---

/// Arena of every known block plus the active chain and candidate set.
#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, BlockId>,
    children: Vec<Vec<BlockId>>,
    candidates: BTreeSet<CandidateKey>,
    /// Parent lacking data → children whose data already arrived.
    unlinked: HashMap<BlockId, Vec<BlockId>>,
    chain: ActiveChain,
    next_sequence: u64,
    best_invalid_trust: U256,
    best_header: Option<BlockId>,
    stake_seen: HashSet<(OutPoint, u32)>,
    dirty: BTreeSet<BlockId>,
}

impl BlockIndex {
    /// First sequence id handed to blocks arriving after startup.
    const FIRST_RUNTIME_SEQUENCE: u64 = 2;

    pub fn new() -> Self {
        Self {
            next_sequence: Self::FIRST_RUNTIME_SEQUENCE,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: BlockId) -> &BlockIndexEntry {
        &self.entries[id.index()]
    }

    fn get_mut(&mut self, id: BlockId) -> &mut BlockIndexEntry {
        &mut self.entries[id.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn lookup_entry(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.lookup(hash).map(|id| self.get(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.entries.len() as u32).map(BlockId)
    }

    pub fn children(&self, id: BlockId) -> &[BlockId] {
        &self.children[id.index()]
    }

    pub fn chain(&self) -> &ActiveChain {
        &self.chain
    }

    pub fn tip(&self) -> Option<BlockId> {
        self.chain.tip()
    }

    pub fn tip_entry(&self) -> Option<&BlockIndexEntry> {
        self.tip().map(|id| self.get(id))
    }

    pub fn in_active_chain(&self, id: BlockId) -> bool {
        self.chain.contains(id, self.get(id).height)
    }

    /// Header with the most trust that is not known to be invalid.
    pub fn best_header(&self) -> Option<BlockId> {
        self.best_header
    }

    pub fn best_invalid_trust(&self) -> U256 {
        self.best_invalid_trust
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Add a header, or return the id it already has.
    ///
    /// The parent must already be indexed; only the very first header may
    /// have no parent.
    pub fn insert_header(&mut self, header: &BlockHeader, params: &ChainParams) -> Result<BlockId, BlockError> {
        let hash = header.hash();
        if let Some(id) = self.lookup(&hash) {
            return Ok(id);
        }

        let prev = match self.lookup(&header.prev_hash) {
            Some(prev) => Some(prev),
            None if self.entries.is_empty() && header.prev_hash == Hash256::ZERO => None,
            None => return Err(BlockError::OrphanBlock(header.prev_hash.to_string())),
        };

        let proof = difficulty::block_proof(header.bits);
        let entropy = kernel::entropy_bit(&hash);
        let (height, trust, skip, stake_modifier, generated_modifier, inherited) = match prev {
            Some(prev_id) => {
                let p = self.get(prev_id);
                let height = p.height + 1;
                let skip = self.ancestor(prev_id, skip_height(i64::from(height)) as u32);
                let (modifier, generated) = if kernel::modifier_interval_crossed(p.header.time, header.time, params) {
                    (kernel::next_stake_modifier(p.stake_modifier, &p.hash, entropy), true)
                } else {
                    (p.stake_modifier, false)
                };
                let inherited = p.status.bits() & BlockStatus::FAILED_MASK != 0;
                (height, p.trust.saturating_add(proof), skip, modifier, generated, inherited)
            }
            None => (0, proof, None, 0, true, false),
        };

        let mut status = BlockStatus::default();
        status.set_validity(Validity::Tree);
        if inherited {
            status.set(BlockStatus::FAILED_CHILD);
        }

        let id = BlockId(self.entries.len() as u32);
        self.entries.push(BlockIndexEntry {
            hash,
            header: header.clone(),
            height,
            trust,
            status,
            prev,
            skip,
            next: None,
            block_pos: None,
            undo_pos: None,
            tx_count: 0,
            chain_tx: 0,
            sequence_id: 0,
            money_supply: 0,
            mint: 0,
            is_proof_of_stake: false,
            entropy_bit: entropy,
            stake_modifier,
            generated_modifier,
            stake_source: None,
            proof_hash: hash,
        });
        self.children.push(Vec::new());
        self.by_hash.insert(hash, id);
        if let Some(prev) = prev {
            self.children[prev.index()].push(id);
        }
        self.dirty.insert(id);

        if !inherited && self.best_header.is_none_or(|best| self.get(best).trust < trust) {
            self.best_header = Some(id);
        }
        debug!(height, %hash, "indexed header");
        Ok(id)
    }

    /// Record that a block's body is stored.
    ///
    /// Makes the entry, and any stored descendants that were waiting on it,
    /// eligible for chain selection once every ancestor has its body.
    pub fn received_body(
        &mut self,
        id: BlockId,
        tx_count: u32,
        pos: DiskPos,
        stake_source: Option<(OutPoint, u32)>,
    ) {
        {
            let entry = self.get_mut(id);
            entry.tx_count = tx_count;
            entry.block_pos = Some(pos);
            entry.status.set(BlockStatus::HAVE_DATA);
            if entry.status.validity() < Validity::Transactions {
                entry.status.set_validity(Validity::Transactions);
            }
            entry.is_proof_of_stake = stake_source.is_some();
            entry.stake_source = stake_source;
        }
        if let Some(stake) = stake_source {
            self.stake_seen.insert(stake);
        }
        self.dirty.insert(id);

        let parent_linked = match self.get(id).prev {
            None => true,
            Some(prev) => self.get(prev).chain_tx > 0,
        };
        if !parent_linked {
            if let Some(prev) = self.get(id).prev {
                self.park(prev, id);
            }
            return;
        }

        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            let prev_tx = self.get(next).prev.map_or(0, |p| self.get(p).chain_tx);
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            let entry = self.get_mut(next);
            entry.chain_tx = prev_tx + u64::from(entry.tx_count);
            entry.sequence_id = sequence;
            if !entry.status.is_failed() {
                let key = Self::key_of(entry, next);
                self.candidates.insert(key);
            }
            if let Some(waiting) = self.unlinked.remove(&next) {
                queue.extend(waiting);
            }
        }
    }

    fn park(&mut self, parent: BlockId, child: BlockId) {
        let waiting = self.unlinked.entry(parent).or_default();
        if !waiting.contains(&child) {
            waiting.push(child);
        }
    }

    pub fn set_undo_pos(&mut self, id: BlockId, pos: DiskPos) {
        let entry = self.get_mut(id);
        entry.undo_pos = Some(pos);
        entry.status.set(BlockStatus::HAVE_UNDO);
        self.dirty.insert(id);
    }

    /// Raise the validity tier. Refused for failed entries; never lowers.
    pub fn raise_validity(&mut self, id: BlockId, tier: Validity) -> bool {
        let entry = self.get_mut(id);
        if entry.status.is_failed() {
            return false;
        }
        if entry.status.validity() < tier {
            entry.status.set_validity(tier);
            self.dirty.insert(id);
        }
        true
    }

    /// Money supply, mint and proof hash, known once the block connects.
    pub fn set_connect_results(&mut self, id: BlockId, money_supply: u64, mint: u64, proof_hash: Hash256) {
        let entry = self.get_mut(id);
        entry.money_supply = money_supply;
        entry.mint = mint;
        entry.proof_hash = proof_hash;
        self.dirty.insert(id);
    }

    pub fn is_stake_seen(&self, stake: &(OutPoint, u32)) -> bool {
        self.stake_seen.contains(stake)
    }

    fn key_of(entry: &BlockIndexEntry, id: BlockId) -> CandidateKey {
        CandidateKey {
            trust: Reverse(entry.trust),
            sequence: entry.sequence_id,
            hash: entry.hash,
            id,
        }
    }

    fn remove_candidate(&mut self, id: BlockId) {
        let key = Self::key_of(self.get(id), id);
        self.candidates.remove(&key);
    }

    // --- Invalidation ---

    /// Mark a block invalid and every descendant as failed by ancestry.
    pub fn mark_failed(&mut self, id: BlockId) {
        let entry = self.get_mut(id);
        entry.status.set(BlockStatus::FAILED_VALID);
        let (trust, height, hash) = (entry.trust, entry.height, entry.hash);
        self.dirty.insert(id);
        self.remove_candidate(id);

        if trust > self.best_invalid_trust {
            self.best_invalid_trust = trust;
            if self.tip_entry().is_some_and(|tip| trust > tip.trust) {
                warn!(height, %hash, "invalid chain has more trust than the active chain");
            }
        }
        let marked = self.mark_descendants_failed(id);
        debug!(height, %hash, descendants = marked, "marked block failed");
        self.refresh_best_header();
    }

    /// Set `FAILED_CHILD` on every descendant of `id`. Returns how many changed.
    pub fn mark_descendants_failed(&mut self, id: BlockId) -> usize {
        let mut marked = 0;
        let mut queue: VecDeque<BlockId> = self.children[id.index()].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            queue.extend(self.children[next.index()].iter().copied());
            self.remove_candidate(next);
            let entry = self.get_mut(next);
            if entry.status.bits() & BlockStatus::FAILED_CHILD == 0 {
                entry.status.set(BlockStatus::FAILED_CHILD);
                self.dirty.insert(next);
                marked += 1;
            }
        }
        marked
    }

    /// Clear failure flags on `id`, its ancestors and its descendants.
    pub fn clear_failure(&mut self, id: BlockId) {
        let mut walk = Some(id);
        while let Some(w) = walk {
            let entry = self.get_mut(w);
            if entry.status.is_failed() {
                entry.status.clear(BlockStatus::FAILED_MASK);
                self.dirty.insert(w);
            }
            walk = self.get(w).prev;
        }

        let mut queue: VecDeque<BlockId> = self.children[id.index()].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            queue.extend(self.children[next.index()].iter().copied());
            let entry = self.get_mut(next);
            if entry.status.is_failed() {
                entry.status.clear(BlockStatus::FAILED_MASK);
                self.dirty.insert(next);
            }
        }

        self.best_invalid_trust = self
            .entries
            .iter()
            .filter(|e| e.status.is_failed())
            .map(|e| e.trust)
            .max()
            .unwrap_or_default();
        self.refresh_best_header();
        self.rebuild_candidates();
    }

    fn refresh_best_header(&mut self) {
        self.best_header = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.status.is_failed())
            .max_by(|(_, a), (_, b)| a.trust.cmp(&b.trust).then(b.sequence_id.cmp(&a.sequence_id)))
            .map(|(i, _)| BlockId(i as u32));
    }

    /// Recompute the candidate set from scratch.
    pub fn rebuild_candidates(&mut self) {
        let tip_trust = self.tip_entry().map(|e| e.trust).unwrap_or_default();
        self.candidates = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.status.is_valid(Validity::Transactions) && e.chain_tx > 0 && e.trust >= tip_trust
            })
            .map(|(i, e)| Self::key_of(e, BlockId(i as u32)))
            .collect();
    }

    /// Best candidate whose path back to the active chain is usable.
    ///
    /// Candidates behind a failed ancestor are marked failed and dropped.
    /// Candidates behind a missing body are parked until it arrives.
    pub fn find_best_candidate(&mut self) -> Option<BlockId> {
        loop {
            let best = self.candidates.first()?.id;

            let mut path = Vec::new();
            let mut walk = Some(best);
            let mut failed_at = None;
            let mut missing_at = None;
            while let Some(w) = walk {
                if self.in_active_chain(w) {
                    break;
                }
                let status = self.get(w).status;
                if status.is_failed() {
                    failed_at = Some(w);
                    break;
                }
                if !status.has_data() {
                    missing_at = Some(w);
                    break;
                }
                path.push(w);
                walk = self.get(w).prev;
            }

            if let Some(failed) = failed_at {
                self.mark_descendants_failed(failed);
                continue;
            }
            if missing_at.is_some() {
                for w in path {
                    self.remove_candidate(w);
                    if let Some(prev) = self.get(w).prev {
                        self.park(prev, w);
                    }
                }
                continue;
            }
            return Some(best);
        }
    }

    /// Drop candidates ranked below the current tip.
    pub fn prune_candidates(&mut self) {
        let Some(tip) = self.tip() else { return };
        let key = Self::key_of(self.get(tip), tip);
        self.candidates.insert(key);
        let _worse = self.candidates.split_off(&key);
        self.candidates.insert(key);
    }

    // --- Active chain ---

    /// Make `id` the tip, relinking `next` pointers along the new path.
    pub fn set_tip(&mut self, id: BlockId) {
        let mut fresh = Vec::new();
        let mut walk = Some(id);
        while let Some(w) = walk {
            if self.in_active_chain(w) {
                break;
            }
            fresh.push(w);
            walk = self.get(w).prev;
        }

        let keep = walk.map_or(0, |w| self.get(w).height as usize + 1);
        let stale: Vec<BlockId> = self.chain.ids.drain(keep..).collect();
        for old in stale {
            self.get_mut(old).next = None;
        }
        for w in fresh.into_iter().rev() {
            if let Some(prev) = self.get(w).prev {
                self.get_mut(prev).next = Some(w);
            }
            self.chain.ids.push(w);
        }
        self.get_mut(id).next = None;
    }

    /// Geometric step-back list of hashes from `id` down to genesis.
    pub fn locator(&self, id: BlockId) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        let mut step = 1u32;
        let mut walk = Some(id);
        while let Some(w) = walk {
            let entry = self.get(w);
            hashes.push(entry.hash);
            if entry.height == 0 {
                break;
            }
            let height = entry.height.saturating_sub(step);
            walk = if self.in_active_chain(w) {
                self.chain.at_height(height)
            } else {
                self.ancestor(w, height)
            };
            if hashes.len() > 10 {
                step = step.saturating_mul(2);
            }
        }
        hashes
    }

    /// Highest locator entry on the active chain, or genesis.
    pub fn find_fork(&self, locator: &[Hash256]) -> Option<BlockId> {
        locator
            .iter()
            .filter_map(|hash| self.lookup(hash))
            .find(|id| self.in_active_chain(*id))
            .or_else(|| self.chain.genesis())
    }

    // --- Traversal ---

    /// Ancestor of `id` at `height`, in O(log n) via skip pointers.
    pub fn ancestor(&self, id: BlockId, height: u32) -> Option<BlockId> {
        let start = self.get(id);
        if height > start.height {
            return None;
        }
        let target = i64::from(height);
        let mut walk = id;
        let mut walk_height = i64::from(start.height);
        while walk_height > target {
            let entry = self.get(walk);
            let h_skip = skip_height(walk_height);
            let h_skip_prev = skip_height(walk_height - 1);
            let take_skip = entry.skip.is_some()
                && (h_skip == target
                    || (h_skip > target && !(h_skip_prev < h_skip - 2 && h_skip_prev >= target)));
            match (take_skip, entry.skip, entry.prev) {
                (true, Some(skip), _) => {
                    walk = skip;
                    walk_height = h_skip;
                }
                (_, _, Some(prev)) => {
                    walk = prev;
                    walk_height -= 1;
                }
                _ => return None,
            }
        }
        Some(walk)
    }

    pub fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let (ha, hb) = (self.get(a).height, self.get(b).height);
        let mut a = if ha > hb { self.ancestor(a, hb)? } else { a };
        let mut b = if hb > ha { self.ancestor(b, ha)? } else { b };
        while a != b {
            a = self.get(a).prev?;
            b = self.get(b).prev?;
        }
        Some(a)
    }

    /// Median time of `id` and up to ten of its ancestors.
    pub fn median_time_past(&self, id: BlockId) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(id);
        while let Some(w) = walk {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = self.get(w);
            times.push(entry.header.time);
            walk = entry.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Most recent block of the given type at or below `id`.
    fn last_of_type(&self, id: Option<BlockId>, is_pos: bool) -> Option<BlockId> {
        let mut walk = id;
        while let Some(w) = walk {
            let entry = self.get(w);
            if entry.is_proof_of_stake == is_pos {
                return Some(w);
            }
            walk = entry.prev;
        }
        None
    }

    /// Bits required for a block of the given type on top of `prev`.
    pub fn next_work_required(&self, prev: BlockId, is_pos: bool, params: &ChainParams) -> u32 {
        let last = self.last_of_type(Some(prev), is_pos);
        let before = last.and_then(|l| self.last_of_type(self.get(l).prev, is_pos));
        // The genesis block anchors neither series.
        let usable = |id: Option<BlockId>| id.filter(|i| self.get(*i).prev.is_some());
        difficulty::next_target_required(
            usable(last).map(|i| self.get(i).sample()),
            usable(before).map(|i| self.get(i).sample()),
            is_pos,
            params,
        )
    }

    /// Highest checkpoint height present in the index.
    pub fn known_checkpoint_height(&self, params: &ChainParams) -> Option<u32> {
        params
            .checkpoints
            .iter()
            .filter(|(_, hash)| self.by_hash.contains_key(hash))
            .map(|(height, _)| *height)
            .max()
    }

    // --- Persistence ---

    /// Serialize and clear every entry changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<DiskIndexEntry> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty.into_iter().map(|id| self.get(id).to_disk()).collect()
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Put entries back on the dirty list after a failed write.
    pub fn mark_dirty(&mut self, hashes: impl IntoIterator<Item = Hash256>) {
        for hash in hashes {
            if let Some(id) = self.lookup(&hash) {
                self.dirty.insert(id);
            }
        }
    }

    /// Rebuild the index from persisted entries and select `best` as the tip.
    ///
    /// Trust, skip pointers and transaction counts are recomputed. The active
    /// chain gets sequence id 0 and every other stored body id 1, so blocks
    /// seen before a restart win ties against blocks seen after it.
    pub fn load(
        mut stored: Vec<DiskIndexEntry>,
        best: &Hash256,
        params: &ChainParams,
    ) -> Result<Self, FatalError> {
        stored.sort_by_key(|e| e.height);
        let mut index = Self::new();

        for disk in stored {
            let prev = if disk.height == 0 {
                None
            } else {
                let prev = index.lookup(&disk.header.prev_hash).ok_or_else(|| {
                    FatalError::Corruption(format!("index entry {} has no parent", disk.hash))
                })?;
                Some(prev)
            };
            let id = index
                .insert_header(&disk.header, params)
                .map_err(|e| FatalError::Corruption(format!("index entry {}: {e}", disk.hash)))?;
            if index.get(id).prev != prev || index.get(id).height != disk.height {
                return Err(FatalError::Corruption(format!("index entry {} misplaced", disk.hash)));
            }

            let prev_chain_tx = prev.map_or(0, |p| index.get(p).chain_tx);
            let entry = index.get_mut(id);
            entry.status = BlockStatus::from_bits(disk.status);
            entry.block_pos = disk.block_pos;
            entry.undo_pos = disk.undo_pos;
            entry.tx_count = disk.tx_count;
            entry.money_supply = disk.money_supply;
            entry.mint = disk.mint;
            entry.is_proof_of_stake = disk.is_proof_of_stake;
            entry.stake_modifier = disk.stake_modifier;
            entry.generated_modifier = disk.generated_modifier;
            entry.stake_source = disk.stake_source;
            entry.proof_hash = disk.proof_hash;
            entry.sequence_id = 1;
            let linked = prev.is_none() || prev_chain_tx > 0;
            if entry.status.has_data() && linked {
                entry.chain_tx = prev_chain_tx + u64::from(entry.tx_count);
            }
            if let Some(stake) = disk.stake_source {
                index.stake_seen.insert(stake);
            }
        }

        for id in index.ids().collect::<Vec<_>>() {
            let entry = index.get(id);
            if entry.status.has_data() && entry.chain_tx == 0 {
                if let Some(prev) = entry.prev {
                    index.park(prev, id);
                }
            }
        }

        let tip = index.lookup(best).ok_or_else(|| {
            FatalError::Corruption(format!("best block {best} not in block index"))
        })?;
        index.set_tip(tip);
        for id in index.chain.ids.clone() {
            index.get_mut(id).sequence_id = 0;
        }

        index.best_invalid_trust = index
            .entries
            .iter()
            .filter(|e| e.status.is_failed())
            .map(|e| e.trust)
            .max()
            .unwrap_or_default();
        index.refresh_best_header();
        index.rebuild_candidates();
        index.dirty.clear();
        Ok(index)
    }
}
