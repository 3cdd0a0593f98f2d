//! Per-height consensus state.

use dbft_types::{
    Block, BlockIndex, ChainTip, ChangeViewReason, CommitSignature, FinalizedBlock, Hash256,
    PublicKey, ValidatorIndex, ValidatorSet, ViewNumber,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::messages::Envelope;

/// Tags asynchronous work with the round it was started for. Results whose
/// epoch differs from the context's current epoch are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Epoch {
    pub block_index: BlockIndex,
    pub view: ViewNumber,
    pub generation: u64,
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.block_index, self.view, self.generation)
    }
}

#[derive(Debug, Clone)]
pub struct Preparation {
    pub block_hash: Hash256,
    pub signature: Vec<u8>,
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub view: ViewNumber,
    pub block_hash: Hash256,
    pub signature: Vec<u8>,
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
pub struct ChangeViewRecord {
    pub new_view: ViewNumber,
    pub reason: ChangeViewReason,
    pub timestamp_ms: u64,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitInsert {
    Inserted,
    Duplicate,
    /// The validator already committed to a different block at this height.
    Conflict { existing: Hash256 },
}

#[derive(Debug, Clone)]
pub struct ConsensusContext {
    block_index: BlockIndex,
    view: ViewNumber,
    validators: ValidatorSet,
    my_index: Option<ValidatorIndex>,
    prev_hash: Hash256,
    prev_timestamp_ms: u64,
    tip_received_ms: u64,
    generation: u64,

    prepare_request: Option<Envelope>,
    proposed_block: Option<Block>,
    expected_transactions: Vec<Hash256>,
    preparations: BTreeMap<ValidatorIndex, Preparation>,
    commits: BTreeMap<ValidatorIndex, CommitRecord>,
    change_views: BTreeMap<ValidatorIndex, ChangeViewRecord>,

    /// Highest block index each validator was last heard at. Seeded with
    /// the tip height and kept across heights.
    last_seen: HashMap<ValidatorIndex, BlockIndex>,
}

impl ConsensusContext {
    pub fn new(
        tip: ChainTip,
        validators: ValidatorSet,
        my_key: Option<&PublicKey>,
        now_ms: u64,
    ) -> Self {
        let my_index = my_key.and_then(|k| validators.index_of(k));
        let last_seen = validators.iter().map(|(i, _)| (i, tip.height)).collect();
        Self {
            block_index: tip.height.next(),
            view: ViewNumber(0),
            validators,
            my_index,
            prev_hash: tip.hash,
            prev_timestamp_ms: tip.timestamp_ms,
            tip_received_ms: now_ms,
            generation: 0,
            prepare_request: None,
            proposed_block: None,
            expected_transactions: Vec::new(),
            preparations: BTreeMap::new(),
            commits: BTreeMap::new(),
            change_views: BTreeMap::new(),
            last_seen,
        }
    }

    /// Moves to a new view within the same height. Commits survive, as do
    /// change-view requests for views beyond the new one.
    pub fn reset(&mut self, new_view: ViewNumber) {
        self.generation += 1;
        self.view = new_view;
        self.prepare_request = None;
        self.proposed_block = None;
        self.expected_transactions.clear();
        self.preparations.clear();
        self.change_views.retain(|_, cv| cv.new_view > new_view);
    }

    /// Replaces all per-height state after a block was persisted.
    pub fn advance(
        &mut self,
        tip: ChainTip,
        validators: ValidatorSet,
        my_key: Option<&PublicKey>,
        now_ms: u64,
    ) {
        let previous = std::mem::take(&mut self.last_seen);
        let generation = self.generation + 1;
        *self = Self::new(tip, validators, my_key, now_ms);
        for (index, seen) in previous {
            if self.validators.contains_index(index) {
                self.update_last_seen(index, seen);
            }
        }
        self.generation = generation;
    }

    pub fn epoch(&self) -> Epoch {
        Epoch {
            block_index: self.block_index,
            view: self.view,
            generation: self.generation,
        }
    }

    pub fn block_index(&self) -> BlockIndex {
        self.block_index
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn my_index(&self) -> Option<ValidatorIndex> {
        self.my_index
    }

    pub fn prev_hash(&self) -> Hash256 {
        self.prev_hash
    }

    pub fn prev_timestamp_ms(&self) -> u64 {
        self.prev_timestamp_ms
    }

    pub fn tip_received_ms(&self) -> u64 {
        self.tip_received_ms
    }

    pub fn n(&self) -> usize {
        self.validators.len()
    }

    pub fn f(&self) -> usize {
        self.validators.f()
    }

    pub fn m(&self) -> usize {
        self.validators.m()
    }

    pub fn primary_index(&self) -> ValidatorIndex {
        self.validators.primary_index(self.block_index, self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.my_index == Some(self.primary_index())
    }

    pub fn is_backup(&self) -> bool {
        self.my_index.is_some() && !self.is_primary()
    }

    pub fn watch_only(&self) -> bool {
        self.my_index.is_none()
    }

    pub fn prepare_request(&self) -> Option<&Envelope> {
        self.prepare_request.as_ref()
    }

    pub fn proposed_block(&self) -> Option<&Block> {
        self.proposed_block.as_ref()
    }

    pub fn expected_transactions(&self) -> &[Hash256] {
        &self.expected_transactions
    }

    pub fn set_proposal(&mut self, request: Envelope, block: Block) {
        self.expected_transactions = block.transactions.clone();
        self.prepare_request = Some(request);
        self.proposed_block = Some(block);
    }

    pub fn request_sent_or_received(&self) -> bool {
        self.prepare_request.is_some()
    }

    pub fn preparations(&self) -> &BTreeMap<ValidatorIndex, Preparation> {
        &self.preparations
    }

    pub fn preparation(&self, index: ValidatorIndex) -> Option<&Preparation> {
        self.preparations.get(&index)
    }

    pub fn record_preparation(&mut self, index: ValidatorIndex, preparation: Preparation) {
        self.preparations.entry(index).or_insert(preparation);
    }

    pub fn response_sent(&self) -> bool {
        self.my_index
            .map(|i| self.preparations.contains_key(&i))
            .unwrap_or(false)
    }

    pub fn has_enough_preparations(&self) -> bool {
        let Some(block) = &self.proposed_block else {
            return false;
        };
        let hash = block.hash();
        self.preparations
            .values()
            .filter(|p| p.block_hash == hash)
            .count()
            >= self.m()
    }

    pub fn commits(&self) -> &BTreeMap<ValidatorIndex, CommitRecord> {
        &self.commits
    }

    pub fn commit(&self, index: ValidatorIndex) -> Option<&CommitRecord> {
        self.commits.get(&index)
    }

    /// Commits are write-once per validator and height.
    pub fn record_commit(&mut self, index: ValidatorIndex, record: CommitRecord) -> CommitInsert {
        match self.commits.get(&index) {
            Some(existing) if existing.block_hash == record.block_hash => CommitInsert::Duplicate,
            Some(existing) => CommitInsert::Conflict {
                existing: existing.block_hash,
            },
            None => {
                self.commits.insert(index, record);
                CommitInsert::Inserted
            }
        }
    }

    pub fn commit_sent(&self) -> bool {
        self.my_index
            .map(|i| self.commits.contains_key(&i))
            .unwrap_or(false)
    }

    pub fn count_committed(&self) -> usize {
        self.commits.len()
    }

    pub fn commit_count_for(&self, block_hash: &Hash256) -> usize {
        self.commits
            .values()
            .filter(|c| &c.block_hash == block_hash)
            .count()
    }

    /// Block hash backed by at least M commits, if any.
    pub fn commit_quorum(&self) -> Option<Hash256> {
        let mut counts: HashMap<Hash256, usize> = HashMap::new();
        for record in self.commits.values() {
            *counts.entry(record.block_hash).or_default() += 1;
        }
        counts
            .into_iter()
            .find(|(_, count)| *count >= self.m())
            .map(|(hash, _)| hash)
    }

    pub fn has_enough_commits(&self) -> bool {
        self.commit_quorum().is_some()
    }

    /// First M commit signatures for `block`, ordered by validator index.
    pub fn finalize(&self, block: &Block) -> Option<FinalizedBlock> {
        let hash = block.hash();
        let signatures: Vec<CommitSignature> = self
            .commits
            .iter()
            .filter(|(_, c)| c.block_hash == hash)
            .take(self.m())
            .map(|(index, c)| CommitSignature {
                validator_index: *index,
                signature: c.signature.clone(),
            })
            .collect();

        if signatures.len() < self.m() {
            return None;
        }

        Some(FinalizedBlock {
            block: block.clone(),
            signatures,
        })
    }

    pub fn change_views(&self) -> &BTreeMap<ValidatorIndex, ChangeViewRecord> {
        &self.change_views
    }

    /// Stores a change-view request unless an equal or newer one from the
    /// same validator is already known. Returns whether it was stored.
    pub fn record_change_view(&mut self, index: ValidatorIndex, record: ChangeViewRecord) -> bool {
        match self.change_views.get(&index) {
            Some(existing) if existing.new_view >= record.new_view => false,
            _ => {
                self.change_views.insert(index, record);
                true
            }
        }
    }

    pub fn my_change_view(&self) -> Option<ViewNumber> {
        self.my_index
            .and_then(|i| self.change_views.get(&i))
            .map(|cv| cv.new_view)
    }

    pub fn has_enough_change_views(&self, target: ViewNumber) -> bool {
        self.change_views
            .values()
            .filter(|cv| cv.new_view >= target)
            .count()
            >= self.m()
    }

    /// Highest view above the current one that at least M validators asked
    /// for.
    pub fn agreed_view(&self) -> Option<ViewNumber> {
        let mut requested: Vec<ViewNumber> = self
            .change_views
            .values()
            .map(|cv| cv.new_view)
            .filter(|v| *v > self.view)
            .collect();
        if requested.len() < self.m() {
            return None;
        }
        requested.sort_unstable_by(|a, b| b.cmp(a));
        Some(requested[self.m() - 1])
    }

    pub fn view_changing(&self) -> bool {
        self.my_change_view().map(|v| v > self.view).unwrap_or(false)
    }

    pub fn update_last_seen(&mut self, index: ValidatorIndex, block_index: BlockIndex) {
        let entry = self.last_seen.entry(index).or_insert(block_index);
        if block_index > *entry {
            *entry = block_index;
        }
    }

    /// Validators not heard from since before the previous height.
    pub fn count_failed(&self) -> usize {
        let Some(threshold) = self.block_index.0.checked_sub(1) else {
            return 0;
        };
        self.validators
            .iter()
            .filter(|(index, _)| Some(*index) != self.my_index)
            .filter(|(index, _)| {
                self.last_seen
                    .get(index)
                    .map_or(false, |seen| seen.0 < threshold)
            })
            .count()
    }

    pub fn more_than_f_committed_or_lost(&self) -> bool {
        self.count_committed() + self.count_failed() > self.f()
    }

    pub fn not_accepting_payloads_due_to_view_changing(&self) -> bool {
        self.view_changing() && !self.more_than_f_committed_or_lost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Commit, RecoveryRequest};
    use dbft_crypto::KeyPair;

    fn setup(n: usize) -> (Vec<KeyPair>, ConsensusContext) {
        let keys: Vec<KeyPair> = (0..n).map(|i| KeyPair::from_seed(&format!("v{}", i))).collect();
        let set = ValidatorSet::new(keys.iter().map(KeyPair::public_key).collect()).unwrap();
        let tip = ChainTip {
            height: BlockIndex(9),
            hash: Hash256::digest(b"tip"),
            timestamp_ms: 1_000,
        };
        let ctx = ConsensusContext::new(tip, set, Some(&keys[0].public_key()), 2_000);
        (keys, ctx)
    }

    fn dummy_envelope(key: &KeyPair, index: u16) -> Envelope {
        Envelope::new_signed(
            BlockIndex(10),
            ValidatorIndex(index),
            ViewNumber(0),
            RecoveryRequest { timestamp_ms: 0 }.into(),
            key,
        )
        .unwrap()
    }

    fn commit_record(key: &KeyPair, index: u16, view: u8, hash: Hash256) -> CommitRecord {
        let envelope = Envelope::new_signed(
            BlockIndex(10),
            ValidatorIndex(index),
            ViewNumber(view),
            Commit {
                block_hash: hash,
                block_signature: key.sign(hash.as_bytes()),
            }
            .into(),
            key,
        )
        .unwrap();
        CommitRecord {
            view: ViewNumber(view),
            block_hash: hash,
            signature: key.sign(hash.as_bytes()),
            envelope,
        }
    }

    fn change_view_record(key: &KeyPair, index: u16, new_view: u8) -> ChangeViewRecord {
        ChangeViewRecord {
            new_view: ViewNumber(new_view),
            reason: ChangeViewReason::Timeout,
            timestamp_ms: 0,
            envelope: dummy_envelope(key, index),
        }
    }

    #[test]
    fn test_new_context_targets_next_height() {
        let (_, ctx) = setup(4);
        assert_eq!(ctx.block_index(), BlockIndex(10));
        assert_eq!(ctx.view(), ViewNumber(0));
        assert_eq!(ctx.my_index(), Some(ValidatorIndex(0)));
        // 10 mod 4
        assert_eq!(ctx.primary_index(), ValidatorIndex(2));
        assert!(ctx.is_backup());
        assert!(!ctx.watch_only());
    }

    #[test]
    fn test_commits_survive_view_reset() {
        let (keys, mut ctx) = setup(4);
        let hash = Hash256::digest(b"block-v0");

        assert_eq!(
            ctx.record_commit(ValidatorIndex(0), commit_record(&keys[0], 0, 0, hash)),
            CommitInsert::Inserted
        );
        assert!(ctx.commit_sent());

        let before = ctx.epoch();
        ctx.reset(ViewNumber(1));

        assert_ne!(ctx.epoch(), before);
        assert_eq!(ctx.view(), ViewNumber(1));
        assert!(ctx.commit_sent());
        assert_eq!(ctx.commit(ValidatorIndex(0)).unwrap().block_hash, hash);
    }

    #[test]
    fn test_commit_conflict_detected() {
        let (keys, mut ctx) = setup(4);
        let a = Hash256::digest(b"a");
        let b = Hash256::digest(b"b");

        ctx.record_commit(ValidatorIndex(1), commit_record(&keys[1], 1, 0, a));
        assert_eq!(
            ctx.record_commit(ValidatorIndex(1), commit_record(&keys[1], 1, 0, a)),
            CommitInsert::Duplicate
        );
        assert_eq!(
            ctx.record_commit(ValidatorIndex(1), commit_record(&keys[1], 1, 1, b)),
            CommitInsert::Conflict { existing: a }
        );
        assert_eq!(ctx.commit(ValidatorIndex(1)).unwrap().block_hash, a);
    }

    #[test]
    fn test_commit_quorum_threshold() {
        let (keys, mut ctx) = setup(4);
        let hash = Hash256::digest(b"block");

        for i in 0..2u16 {
            ctx.record_commit(ValidatorIndex(i), commit_record(&keys[i as usize], i, 0, hash));
        }
        assert!(!ctx.has_enough_commits());

        ctx.record_commit(ValidatorIndex(2), commit_record(&keys[2], 2, 0, hash));
        assert_eq!(ctx.commit_quorum(), Some(hash));
    }

    #[test]
    fn test_change_view_quorum_and_reset() {
        let (keys, mut ctx) = setup(4);

        assert!(ctx.record_change_view(ValidatorIndex(1), change_view_record(&keys[1], 1, 1)));
        assert!(!ctx.record_change_view(ValidatorIndex(1), change_view_record(&keys[1], 1, 1)));
        assert!(ctx.record_change_view(ValidatorIndex(2), change_view_record(&keys[2], 2, 2)));
        assert!(!ctx.has_enough_change_views(ViewNumber(1)));

        assert!(ctx.record_change_view(ValidatorIndex(0), change_view_record(&keys[0], 0, 1)));
        assert!(ctx.view_changing());
        assert!(ctx.has_enough_change_views(ViewNumber(1)));
        assert!(!ctx.has_enough_change_views(ViewNumber(2)));

        ctx.reset(ViewNumber(1));
        assert!(!ctx.view_changing());
        assert_eq!(ctx.change_views().len(), 1);
        assert!(ctx.change_views().contains_key(&ValidatorIndex(2)));
    }

    #[test]
    fn test_count_failed_uses_last_seen() {
        let (keys, mut ctx) = setup(4);
        // Everyone starts as seen at the tip height.
        assert_eq!(ctx.count_failed(), 0);
        assert!(!ctx.more_than_f_committed_or_lost());

        ctx.update_last_seen(ValidatorIndex(1), BlockIndex(10));
        ctx.update_last_seen(ValidatorIndex(2), BlockIndex(10));
        let set = ctx.validators().clone();
        ctx.advance(
            ChainTip {
                height: BlockIndex(10),
                hash: Hash256::digest(b"b10"),
                timestamp_ms: 3_000,
            },
            set,
            Some(&keys[0].public_key()),
            4_000,
        );

        // Validator 3 was last heard at height 9.
        assert_eq!(ctx.count_failed(), 1);
        assert!(!ctx.more_than_f_committed_or_lost());

        ctx.record_commit(
            ValidatorIndex(1),
            commit_record(&keys[1], 1, 0, Hash256::digest(b"b11")),
        );
        assert!(ctx.more_than_f_committed_or_lost());
    }

    #[test]
    fn test_advance_keeps_last_seen() {
        let (keys, mut ctx) = setup(4);
        ctx.update_last_seen(ValidatorIndex(1), BlockIndex(10));
        ctx.record_commit(
            ValidatorIndex(1),
            commit_record(&keys[1], 1, 0, Hash256::digest(b"x")),
        );
        let generation = ctx.epoch().generation;

        let set = ctx.validators().clone();
        ctx.advance(
            ChainTip {
                height: BlockIndex(10),
                hash: Hash256::digest(b"x"),
                timestamp_ms: 3_000,
            },
            set,
            Some(&keys[0].public_key()),
            4_000,
        );

        assert_eq!(ctx.block_index(), BlockIndex(11));
        assert_eq!(ctx.count_committed(), 0);
        assert!(ctx.epoch().generation > generation);
        assert!(ctx.last_seen.contains_key(&ValidatorIndex(1)));
    }

    #[test]
    fn test_watch_only_context() {
        let (_, ctx) = setup(4);
        let outsider = KeyPair::from_seed("outsider");
        let watcher = ConsensusContext::new(
            ChainTip::genesis(0),
            ctx.validators().clone(),
            Some(&outsider.public_key()),
            0,
        );
        assert!(watcher.watch_only());
        assert!(!watcher.is_primary());
        assert!(!watcher.is_backup());
        assert!(!watcher.commit_sent());
    }
}
