//! Deterministic in-memory network of consensus state machines.
//!
//! Every node is a bare [`ConsensusStateMachine`]. Messages go through the
//! wire codec, time is virtual, and timers fire only when the message queue
//! is drained, so a run is fully reproducible from its seed.
//!
//! A node whose timer fires while a peer already persisted its current
//! height copies that block instead, the way the service catches up from a
//! synced ledger on tick.

use dbft_consensus::{
    decode, encode, Action, ConsensusPayload, ConsensusStateMachine, Envelope, Epoch, Event,
    VerificationResult,
};
use dbft_crypto::KeyPair;
use dbft_types::{
    BlockIndex, ByzantineViolation, ChainTip, ConsensusSettings, FinalizedBlock, Hash256,
    ValidatorSet,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashSet, VecDeque};

pub const START_MS: u64 = 1_700_000_000_000;
const MAX_STEPS: usize = 1_000_000;

/// Routes consensus logs through the test writer. Set `RUST_LOG` to see them.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub validators: usize,
    pub seed: u64,
    /// Deliver every network message twice.
    pub duplicate: bool,
    /// Deliver queued inputs in random order.
    pub reorder: bool,
    /// Probability that a single network message is lost.
    pub drop: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            validators: 4,
            seed: 42,
            duplicate: false,
            reorder: false,
            drop: 0.0,
        }
    }
}

pub struct Simulation {
    pub keys: Vec<KeyPair>,
    pub validators: ValidatorSet,
    pub nodes: Vec<ConsensusStateMachine>,
    /// Blocks each node handed to storage, in order.
    pub finalized: Vec<Vec<FinalizedBlock>>,
    pub violations: Vec<(usize, ByzantineViolation)>,
    pub now: u64,
    offline: HashSet<usize>,
    mempools: Vec<Vec<Hash256>>,
    invalid: HashSet<Hash256>,
    /// Nodes that propose mempool contents without verifying them.
    unchecked: HashSet<usize>,
    /// Nodes that send a conflicting proposal to odd-indexed peers.
    equivocating: HashSet<usize>,
    queue: VecDeque<(usize, Event)>,
    /// Envelopes for heights a node has not reached yet.
    deferred: Vec<Vec<Envelope>>,
    timers: Vec<Option<(Epoch, u64)>>,
    config: SimConfig,
    rng: StdRng,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Self {
        init_logging();

        let keys: Vec<KeyPair> = (0..config.validators)
            .map(|i| KeyPair::from_seed(&format!("sim-validator-{}", i)))
            .collect();
        let validators =
            ValidatorSet::new(keys.iter().map(KeyPair::public_key).collect()).unwrap();
        let genesis = ChainTip {
            height: BlockIndex(0),
            hash: Hash256::digest(b"sim-genesis"),
            timestamp_ms: START_MS - 1_000,
        };

        let nodes = keys
            .iter()
            .map(|key| {
                ConsensusStateMachine::new(
                    ConsensusSettings::default(),
                    Some(key.clone()),
                    genesis.clone(),
                    validators.clone(),
                    START_MS,
                )
            })
            .collect();

        let default_mempool: Vec<Hash256> = (0..5u8)
            .map(|i| Hash256::digest(&[b't', b'x', i]))
            .collect();

        Self {
            nodes,
            finalized: vec![Vec::new(); config.validators],
            violations: Vec::new(),
            now: START_MS,
            offline: HashSet::new(),
            mempools: vec![default_mempool; config.validators],
            invalid: HashSet::new(),
            unchecked: HashSet::new(),
            equivocating: HashSet::new(),
            queue: VecDeque::new(),
            deferred: vec![Vec::new(); config.validators],
            timers: vec![None; config.validators],
            rng: StdRng::seed_from_u64(config.seed),
            keys,
            validators,
            config,
        }
    }

    pub fn set_offline(&mut self, node: usize) {
        self.offline.insert(node);
    }

    pub fn set_mempool(&mut self, node: usize, hashes: Vec<Hash256>) {
        self.mempools[node] = hashes;
    }

    pub fn mark_invalid(&mut self, hash: Hash256) {
        self.invalid.insert(hash);
    }

    pub fn mempool(&self, node: usize) -> &[Hash256] {
        &self.mempools[node]
    }

    /// `node` proposes whatever its mempool holds, invalid transactions
    /// included.
    pub fn set_unchecked_proposer(&mut self, node: usize) {
        self.unchecked.insert(node);
    }

    /// Whenever `node` broadcasts a proposal, odd-indexed peers receive a
    /// second proposal for the same height and view, signed by `node`.
    /// The node otherwise follows the protocol in every view.
    pub fn set_equivocating(&mut self, node: usize) {
        self.equivocating.insert(node);
    }

    pub fn online(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|i| !self.offline.contains(i))
    }

    /// Queues an arbitrary envelope for `to`, as if a peer sent it.
    pub fn inject(&mut self, to: usize, envelope: &Envelope) {
        let bytes = encode(envelope).unwrap();
        self.queue
            .push_back((to, Event::Envelope(decode(&bytes).unwrap())));
    }

    pub fn start(&mut self) {
        let online: Vec<usize> = self.online().collect();
        for node in online {
            self.process(node, Event::Start);
        }
    }

    /// Runs until every online node persisted `height`, or virtual time
    /// passes `budget_ms`. Returns whether the height was reached.
    pub fn run_until_height(&mut self, height: u32, budget_ms: u64) -> bool {
        let deadline = self.now + budget_ms;

        for _ in 0..MAX_STEPS {
            if self.reached(height) {
                return true;
            }

            if let Some((node, event)) = self.next_queued() {
                self.process(node, event);
                continue;
            }

            let next_timer = self
                .timers
                .iter()
                .enumerate()
                .filter(|(node, _)| !self.offline.contains(node))
                .filter_map(|(node, timer)| timer.map(|(epoch, at)| (at, node, epoch)))
                .min_by_key(|(at, node, _)| (*at, *node));

            match next_timer {
                Some((at, node, epoch)) if at <= deadline => {
                    self.now = self.now.max(at);
                    self.timers[node] = None;
                    if !self.catch_up(node) {
                        self.process(node, Event::Timer { epoch });
                    }
                }
                _ => return false,
            }
        }
        false
    }

    pub fn reached(&self, height: u32) -> bool {
        self.online()
            .all(|node| self.finalized[node].len() >= height as usize)
    }

    /// Finalized block hashes at `height` across online nodes.
    pub fn hashes_at(&self, height: u32) -> HashSet<Hash256> {
        self.online()
            .filter_map(|node| self.finalized[node].get(height as usize - 1))
            .map(FinalizedBlock::hash)
            .collect()
    }

    fn next_queued(&mut self) -> Option<(usize, Event)> {
        if self.config.reorder && self.queue.len() > 1 {
            let index = self.rng.gen_range(0..self.queue.len());
            return self.queue.remove(index);
        }
        self.queue.pop_front()
    }

    fn process(&mut self, node: usize, event: Event) {
        if self.offline.contains(&node) {
            return;
        }
        if let Event::Envelope(envelope) = &event {
            if envelope.block_index > self.nodes[node].block_index() {
                self.deferred[node].push(envelope.clone());
                return;
            }
        }
        let actions = self.nodes[node]
            .handle(event, self.now)
            .expect("consensus halted");
        self.apply(node, actions);
    }

    /// Copies the block at `node`'s current height from a peer that already
    /// persisted it.
    fn catch_up(&mut self, node: usize) -> bool {
        let height = self.finalized[node].len();
        let block = self
            .online()
            .filter(|peer| *peer != node)
            .find_map(|peer| self.finalized[peer].get(height).cloned());
        match block {
            Some(block) => {
                self.persist(node, block);
                true
            }
            None => false,
        }
    }

    /// Same height and view as `envelope`, different nonce, validly signed.
    fn conflicting_proposal(&self, node: usize, envelope: &Envelope) -> Option<Envelope> {
        let ConsensusPayload::PrepareRequest(request) = &envelope.payload else {
            return None;
        };
        let mut request = request.clone();
        request.nonce = request.nonce.wrapping_add(1);
        let variant = Envelope::new_signed(
            envelope.block_index,
            envelope.validator_index,
            envelope.view,
            request.into(),
            &self.keys[node],
        )
        .unwrap();
        Some(variant)
    }

    fn deliver(&mut self, to: usize, envelope: &Envelope) {
        if self.offline.contains(&to) {
            return;
        }
        let copies = if self.config.duplicate { 2 } else { 1 };
        let bytes = encode(envelope).unwrap();
        for _ in 0..copies {
            if self.config.drop > 0.0 && self.rng.gen_bool(self.config.drop) {
                continue;
            }
            self.queue
                .push_back((to, Event::Envelope(decode(&bytes).unwrap())));
        }
    }

    fn apply(&mut self, node: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast(envelope) => {
                    let variant = if self.equivocating.contains(&node) {
                        self.conflicting_proposal(node, &envelope)
                    } else {
                        None
                    };
                    for peer in 0..self.nodes.len() {
                        if peer == node {
                            continue;
                        }
                        match &variant {
                            Some(variant) if peer % 2 == 1 => self.deliver(peer, variant),
                            _ => self.deliver(peer, &envelope),
                        }
                    }
                }
                Action::SendTo {
                    validator,
                    envelope,
                } => self.deliver(validator.as_usize(), &envelope),
                Action::SetTimer { epoch, duration } => {
                    self.timers[node] = Some((epoch, self.now + duration.as_millis() as u64));
                }
                Action::CollectCandidates { epoch, max_count } => {
                    let candidates: Vec<Hash256> =
                        self.mempools[node].iter().take(max_count).copied().collect();
                    let hashes = if self.unchecked.contains(&node) {
                        candidates
                    } else {
                        // Rejected transactions leave the mempool for good.
                        let invalid = &self.invalid;
                        self.mempools[node].retain(|h| !invalid.contains(h));
                        candidates
                            .into_iter()
                            .filter(|h| !invalid.contains(h))
                            .collect()
                    };
                    self.queue
                        .push_back((node, Event::CandidatesReady { epoch, hashes }));
                }
                Action::VerifyTransactions { epoch, hashes } => {
                    let result = hashes
                        .iter()
                        .find(|h| self.invalid.contains(h))
                        .map(|hash| VerificationResult::Invalid { hash: *hash })
                        .unwrap_or(VerificationResult::Valid);
                    self.queue
                        .push_back((node, Event::TransactionsVerified { epoch, result }));
                }
                Action::PersistBlock(block) => self.persist(node, block),
                Action::ReportViolation(violation) => self.violations.push((node, violation)),
            }
        }
    }

    fn persist(&mut self, node: usize, block: FinalizedBlock) {
        let tip = ChainTip {
            height: block.index(),
            hash: block.hash(),
            timestamp_ms: block.block.header.timestamp_ms,
        };
        self.finalized[node].push(block);
        self.timers[node] = None;
        let next = self.nodes[node]
            .advance(tip, self.validators.clone(), self.now)
            .expect("consensus halted");
        for envelope in std::mem::take(&mut self.deferred[node]) {
            self.queue.push_back((node, Event::Envelope(envelope)));
        }
        self.apply(node, next);
    }
}
