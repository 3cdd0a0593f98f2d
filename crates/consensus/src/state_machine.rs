//! Sans-IO dBFT round state machine.
//!
//! [`ConsensusStateMachine::handle`] consumes one [`Event`] and returns the
//! [`Action`]s the caller has to perform. It never blocks and never touches
//! the network, storage or wall clock; the caller passes the current time in
//! with every event. This keeps every transition deterministic and lets the
//! same code run under the tokio service and the in-memory simulations.
//!
//! # Round flow
//!
//! 1. The primary collects candidates, proposes, and counts its proposal as
//!    its own preparation.
//! 2. Backups validate the proposal, have the transactions verified, and
//!    answer with a signed preparation.
//! 3. With M preparations a node commits. Commits are never withdrawn.
//! 4. With M commits on the proposal hash the block is handed to storage.
//!
//! Timeouts lead to change-view requests. Once M validators ask for a higher
//! view, everyone moves there and the next primary proposes.

use dbft_crypto::{merkle_root, verify_signature, KeyPair};
use dbft_types::{
    Block, BlockHeader, BlockIndex, ByzantineViolation, ChainTip, ChangeViewReason,
    ConsensusError, ConsensusSettings, FinalizedBlock, Hash256, Result, ValidatorIndex,
    ValidatorSet, ViewNumber,
};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::byzantine::ByzantineDetector;
use crate::context::{
    ChangeViewRecord, CommitInsert, CommitRecord, ConsensusContext, Epoch, Preparation,
};
use crate::fsm::{RoundFsm, RoundState};
use crate::messages::{
    preparation_signing_bytes, ChangeView, Commit, ConsensusPayload, Envelope, PrepareRequest,
    PrepareResponse, RecoveryMessage, RecoveryRequest,
};

pub const BLOCK_VERSION: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Valid,
    Invalid { hash: Hash256 },
}

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// Begin the round for the current context.
    Start,
    /// Decoded envelope from a peer. Signatures are checked here.
    Envelope(Envelope),
    /// The round timer armed by [`Action::SetTimer`] fired.
    Timer { epoch: Epoch },
    /// Answer to [`Action::CollectCandidates`]: mempool candidates that
    /// passed transaction verification.
    CandidatesReady { epoch: Epoch, hashes: Vec<Hash256> },
    /// Verifier answer to [`Action::VerifyTransactions`].
    TransactionsVerified { epoch: Epoch, result: VerificationResult },
}

/// Outputs of the state machine, executed by the caller.
#[derive(Debug, Clone)]
pub enum Action {
    Broadcast(Envelope),
    SendTo {
        validator: ValidatorIndex,
        envelope: Envelope,
    },
    /// Replace the round timer.
    SetTimer { epoch: Epoch, duration: Duration },
    CollectCandidates { epoch: Epoch, max_count: usize },
    VerifyTransactions { epoch: Epoch, hashes: Vec<Hash256> },
    PersistBlock(FinalizedBlock),
    ReportViolation(ByzantineViolation),
}

pub struct ConsensusStateMachine {
    ctx: ConsensusContext,
    fsm: RoundFsm,
    settings: ConsensusSettings,
    key: Option<KeyPair>,
    detector: ByzantineDetector,

    /// Proposal waiting on transaction verification.
    pending_proposal: Option<(Envelope, Block)>,
    proposal_rejected: bool,
    /// Preparations that arrived before the proposal.
    buffered_responses: BTreeMap<ValidatorIndex, Envelope>,
    collecting: bool,
    /// Views we already asked recovery for at this height.
    recovery_requested: HashSet<ViewNumber>,
    now_ms: u64,
}

impl ConsensusStateMachine {
    pub fn new(
        settings: ConsensusSettings,
        key: Option<KeyPair>,
        tip: ChainTip,
        validators: ValidatorSet,
        now_ms: u64,
    ) -> Self {
        if validators.len() < 4 {
            warn!(
                "Validator set of {} tolerates no byzantine faults (f=0)",
                validators.len()
            );
        }

        let my_key = key.as_ref().map(KeyPair::public_key);
        let ctx = ConsensusContext::new(tip, validators, my_key.as_ref(), now_ms);

        if ctx.watch_only() {
            info!("Local key is not in the validator set; running watch-only");
        }

        Self {
            fsm: RoundFsm::new(ctx.block_index()),
            ctx,
            settings,
            key,
            detector: ByzantineDetector::new(),
            pending_proposal: None,
            proposal_rejected: false,
            buffered_responses: BTreeMap::new(),
            collecting: false,
            recovery_requested: HashSet::new(),
            now_ms,
        }
    }

    pub fn context(&self) -> &ConsensusContext {
        &self.ctx
    }

    pub fn state(&self) -> RoundState {
        self.fsm.current_state()
    }

    pub fn epoch(&self) -> Epoch {
        self.ctx.epoch()
    }

    pub fn settings(&self) -> &ConsensusSettings {
        &self.settings
    }

    pub fn detector(&self) -> &ByzantineDetector {
        &self.detector
    }

    /// Processes one event. Invalid or stale inputs are dropped and logged;
    /// only fatal errors are returned.
    pub fn handle(&mut self, event: Event, now_ms: u64) -> Result<Vec<Action>> {
        self.now_ms = now_ms;
        let mut out = Vec::new();

        let result = match event {
            Event::Start => self.start_round(&mut out),
            Event::Envelope(envelope) => self.on_envelope(envelope, &mut out),
            Event::Timer { epoch } => self.on_timer(epoch, &mut out),
            Event::CandidatesReady { epoch, hashes } => self.on_candidates(epoch, hashes, &mut out),
            Event::TransactionsVerified { epoch, result } => {
                self.on_verified(epoch, result, &mut out)
            }
        };

        Self::absorb(result)?;
        Ok(out)
    }

    /// Starts the next height from a freshly persisted tip.
    pub fn advance(
        &mut self,
        tip: ChainTip,
        validators: ValidatorSet,
        now_ms: u64,
    ) -> Result<Vec<Action>> {
        let my_key = self.key.as_ref().map(KeyPair::public_key);
        self.ctx.advance(tip, validators, my_key.as_ref(), now_ms);
        self.fsm.advance(self.ctx.block_index());
        self.clear_round();
        self.recovery_requested.clear();
        self.handle(Event::Start, now_ms)
    }

    fn absorb(result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                error!("Fatal consensus error: {}", e);
                Err(e)
            }
            Err(e @ ConsensusError::StaleMessage(_)) => {
                trace!("Dropped input: {}", e);
                Ok(())
            }
            Err(e) => {
                warn!("Dropped input: {}", e);
                Ok(())
            }
        }
    }

    fn clear_round(&mut self) {
        self.pending_proposal = None;
        self.proposal_rejected = false;
        self.buffered_responses.clear();
        self.collecting = false;
    }

    fn start_round(&mut self, out: &mut Vec<Action>) -> Result<()> {
        let epoch = self.ctx.epoch();

        if self.ctx.is_primary() {
            let elapsed = self.now_ms.saturating_sub(self.ctx.tip_received_ms());
            let delay = Duration::from_millis(self.settings.block_time_ms.saturating_sub(elapsed));
            info!(
                "Round started: height={} view={} role=primary proposing_in={:?}",
                self.ctx.block_index(),
                self.ctx.view(),
                delay
            );
            out.push(Action::SetTimer {
                epoch,
                duration: delay,
            });
            return Ok(());
        }

        self.fsm.wait_for_proposal()?;
        info!(
            "Round started: height={} view={} role={} primary={}",
            self.ctx.block_index(),
            self.ctx.view(),
            if self.ctx.watch_only() { "watcher" } else { "backup" },
            self.ctx.primary_index()
        );

        if !self.ctx.watch_only() {
            out.push(Action::SetTimer {
                epoch,
                duration: self.settings.view_timeout(self.ctx.view()),
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Timers and asynchronous results
    // ---------------------------------------------------------------------

    fn on_timer(&mut self, epoch: Epoch, out: &mut Vec<Action>) -> Result<()> {
        if epoch != self.ctx.epoch() {
            trace!("Ignoring timer for stale epoch {}", epoch);
            return Ok(());
        }
        if self.ctx.watch_only() || self.fsm.is_terminal() {
            return Ok(());
        }

        if self.ctx.is_primary() && !self.ctx.request_sent_or_received() && !self.collecting {
            self.collecting = true;
            debug!("Collecting candidates for height {}", self.ctx.block_index());
            out.push(Action::CollectCandidates {
                epoch,
                max_count: self.settings.max_transactions_per_block,
            });
            out.push(Action::SetTimer {
                epoch,
                duration: self.settings.view_timeout(self.ctx.view()),
            });
            return Ok(());
        }

        if self.ctx.commit_sent() {
            info!(
                "Timer expired after commit at height={} view={}; rebroadcasting recovery",
                self.ctx.block_index(),
                self.ctx.view()
            );
            let envelope = self.sign_payload(self.make_recovery_message().into())?;
            out.push(Action::Broadcast(envelope));
            out.push(Action::SetTimer {
                epoch,
                duration: self.settings.view_timeout(self.ctx.view()),
            });
            return Ok(());
        }

        let reason = if self.pending_proposal.is_some() {
            ChangeViewReason::TxNotFound
        } else {
            ChangeViewReason::Timeout
        };
        self.request_change_view(reason, out)
    }

    fn on_candidates(
        &mut self,
        epoch: Epoch,
        hashes: Vec<Hash256>,
        out: &mut Vec<Action>,
    ) -> Result<()> {
        if epoch != self.ctx.epoch() {
            trace!("Ignoring candidates for stale epoch {}", epoch);
            return Ok(());
        }
        if !self.ctx.is_primary() || self.ctx.request_sent_or_received() {
            return Ok(());
        }
        self.collecting = false;

        let mut seen = HashSet::new();
        let transactions: Vec<Hash256> = hashes
            .into_iter()
            .filter(|h| seen.insert(*h))
            .take(self.settings.max_transactions_per_block)
            .collect();

        let request = PrepareRequest {
            timestamp_ms: self.now_ms.max(self.ctx.prev_timestamp_ms() + 1),
            nonce: rand::random(),
            next_consensus: self.ctx.validators().consensus_hash(),
            transaction_hashes: transactions,
        };

        let my_index = self.my_index()?;
        let block = self.build_block(&request, my_index);
        let block_hash = block.hash();
        let tx_count = block.transactions.len();
        let envelope = self.sign_payload(request.into())?;

        self.ctx.record_preparation(
            my_index,
            Preparation {
                block_hash,
                signature: envelope.signature.clone(),
                envelope: envelope.clone(),
            },
        );
        self.ctx.set_proposal(envelope.clone(), block);
        self.fsm.send_proposal()?;

        info!(
            "Proposed block {} at height={} view={} with {} transactions",
            block_hash,
            self.ctx.block_index(),
            self.ctx.view(),
            tx_count
        );

        out.push(Action::Broadcast(envelope));
        out.push(Action::SetTimer {
            epoch,
            duration: self.settings.view_timeout(self.ctx.view()),
        });

        self.check_preparations(out)
    }

    fn on_verified(
        &mut self,
        epoch: Epoch,
        result: VerificationResult,
        out: &mut Vec<Action>,
    ) -> Result<()> {
        if epoch != self.ctx.epoch() {
            debug!("Discarding verification result for stale epoch {}", epoch);
            return Ok(());
        }
        if self.pending_proposal.is_none() {
            return Ok(());
        }

        match result {
            VerificationResult::Valid => self.accept_proposal(out),
            VerificationResult::Invalid { hash } => {
                warn!(
                    "Proposal at height={} view={} contains invalid transaction {}",
                    self.ctx.block_index(),
                    self.ctx.view(),
                    hash
                );
                self.pending_proposal = None;
                self.proposal_rejected = true;
                self.request_change_view(ChangeViewReason::TxInvalid, out)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Inbound envelopes
    // ---------------------------------------------------------------------

    fn on_envelope(&mut self, envelope: Envelope, out: &mut Vec<Action>) -> Result<()> {
        if !self.ctx.validators().contains_index(envelope.validator_index) {
            return Err(ConsensusError::UnauthorizedSender {
                validator: envelope.validator_index,
                kind: envelope.kind().to_string(),
            });
        }

        if envelope.block_index != self.ctx.block_index() {
            if envelope.block_index > self.ctx.block_index()
                && envelope.verify(self.ctx.validators()).is_ok()
            {
                self.ctx
                    .update_last_seen(envelope.validator_index, envelope.block_index);
            }
            return Err(ConsensusError::StaleMessage(format!(
                "{} while at height {}",
                envelope,
                self.ctx.block_index()
            )));
        }

        if Some(envelope.validator_index) == self.ctx.my_index() {
            return Ok(());
        }

        if let Err(e) = envelope.verify(self.ctx.validators()) {
            out.push(Action::ReportViolation(
                self.detector.invalid_signature(&envelope, &e),
            ));
            return Err(e);
        }

        self.ctx
            .update_last_seen(envelope.validator_index, envelope.block_index);
        trace!("Processing {}", envelope);

        match &envelope.payload {
            ConsensusPayload::PrepareRequest(request) => {
                let request = request.clone();
                self.on_prepare_request(envelope, request, out)
            }
            ConsensusPayload::PrepareResponse(response) => {
                let response = response.clone();
                self.on_prepare_response(envelope, response, out)
            }
            ConsensusPayload::ChangeView(change_view) => {
                let change_view = change_view.clone();
                self.on_change_view(envelope, change_view, out)
            }
            ConsensusPayload::Commit(commit) => {
                let commit = commit.clone();
                self.on_commit(envelope, commit, out)
            }
            ConsensusPayload::RecoveryRequest(_) => self.on_recovery_request(&envelope, out),
            ConsensusPayload::RecoveryMessage(message) => {
                let message = message.clone();
                self.on_recovery_message(&envelope, message, out)
            }
        }
    }

    /// Proposals and preparations only count in the view they were made for.
    fn check_view(&mut self, envelope: &Envelope, out: &mut Vec<Action>) -> Result<()> {
        if envelope.view == self.ctx.view() {
            return Ok(());
        }
        if envelope.view > self.ctx.view() {
            self.request_recovery_once(envelope.view, out)?;
        }
        Err(ConsensusError::StaleMessage(format!(
            "{} while in view {}",
            envelope,
            self.ctx.view()
        )))
    }

    fn on_prepare_request(
        &mut self,
        envelope: Envelope,
        request: PrepareRequest,
        out: &mut Vec<Action>,
    ) -> Result<()> {
        self.check_view(&envelope, out)?;

        let existing = self
            .ctx
            .prepare_request()
            .or(self.pending_proposal.as_ref().map(|(e, _)| e));
        if let Some(existing) = existing {
            if existing.payload != envelope.payload && existing.validator_index == envelope.validator_index
            {
                let violation = self.detector.conflicting_proposal(&envelope, existing);
                out.push(Action::ReportViolation(violation));
            }
            return Ok(());
        }
        if self.proposal_rejected {
            return Ok(());
        }

        if self.ctx.not_accepting_payloads_due_to_view_changing() {
            debug!("Ignoring proposal while changing view");
            return Ok(());
        }

        let primary = self.ctx.primary_index();
        if envelope.validator_index != primary {
            out.push(Action::ReportViolation(
                self.detector.unauthorized_proposal(&envelope, primary),
            ));
            return Err(ConsensusError::UnauthorizedSender {
                validator: envelope.validator_index,
                kind: envelope.kind().to_string(),
            });
        }

        self.validate_proposal(&request)?;

        let block = self.build_block(&request, primary);
        info!(
            "Received proposal {} from primary {} at height={} view={} ({} transactions)",
            block.hash(),
            primary,
            self.ctx.block_index(),
            self.ctx.view(),
            block.transactions.len()
        );

        let hashes = block.transactions.clone();
        self.pending_proposal = Some((envelope, block));

        if hashes.is_empty() {
            return self.accept_proposal(out);
        }

        out.push(Action::VerifyTransactions {
            epoch: self.ctx.epoch(),
            hashes,
        });
        Ok(())
    }

    fn validate_proposal(&self, request: &PrepareRequest) -> Result<()> {
        if request.timestamp_ms <= self.ctx.prev_timestamp_ms() {
            return Err(ConsensusError::InvalidProposal(format!(
                "timestamp {} not after previous block {}",
                request.timestamp_ms,
                self.ctx.prev_timestamp_ms()
            )));
        }

        let latest = self.now_ms.saturating_add(self.settings.max_future_drift_ms);
        if request.timestamp_ms > latest {
            return Err(ConsensusError::InvalidProposal(format!(
                "timestamp {} too far in the future (now {})",
                request.timestamp_ms, self.now_ms
            )));
        }

        if request.next_consensus != self.ctx.validators().consensus_hash() {
            return Err(ConsensusError::InvalidProposal(format!(
                "unexpected next_consensus {}",
                request.next_consensus
            )));
        }

        if request.transaction_hashes.len() > self.settings.max_transactions_per_block {
            return Err(ConsensusError::InvalidProposal(format!(
                "{} transactions exceeds limit of {}",
                request.transaction_hashes.len(),
                self.settings.max_transactions_per_block
            )));
        }

        let unique: HashSet<&Hash256> = request.transaction_hashes.iter().collect();
        if unique.len() != request.transaction_hashes.len() {
            return Err(ConsensusError::InvalidProposal(
                "duplicate transaction hashes".to_string(),
            ));
        }

        Ok(())
    }

    fn accept_proposal(&mut self, out: &mut Vec<Action>) -> Result<()> {
        let Some((envelope, block)) = self.pending_proposal.take() else {
            return Ok(());
        };
        let block_hash = block.hash();
        let primary = envelope.validator_index;

        self.ctx.record_preparation(
            primary,
            Preparation {
                block_hash,
                signature: envelope.signature.clone(),
                envelope: envelope.clone(),
            },
        );
        self.ctx.set_proposal(envelope, block);

        if let (Some(my_index), Some(key)) = (self.ctx.my_index(), self.key.as_ref()) {
            let preparation_signature = key.sign(&preparation_signing_bytes(&block_hash));
            let response = PrepareResponse {
                preparation_hash: block_hash,
                preparation_signature: preparation_signature.clone(),
            };
            let envelope = self.sign_payload(response.into())?;
            self.ctx.record_preparation(
                my_index,
                Preparation {
                    block_hash,
                    signature: preparation_signature,
                    envelope: envelope.clone(),
                },
            );
            debug!(
                "Sent preparation for {} at height={} view={}",
                block_hash,
                self.ctx.block_index(),
                self.ctx.view()
            );
            out.push(Action::Broadcast(envelope));
        }

        let buffered = std::mem::take(&mut self.buffered_responses);
        for (_, envelope) in buffered {
            if let ConsensusPayload::PrepareResponse(response) = &envelope.payload {
                let response = response.clone();
                Self::absorb(self.on_prepare_response(envelope, response, out))?;
            }
        }

        self.check_preparations(out)?;
        self.check_commits(out)
    }

    fn on_prepare_response(
        &mut self,
        envelope: Envelope,
        response: PrepareResponse,
        out: &mut Vec<Action>,
    ) -> Result<()> {
        self.check_view(&envelope, out)?;
        let index = envelope.validator_index;

        if let Some(existing) = self.ctx.preparation(index) {
            if existing.block_hash != response.preparation_hash {
                let existing_hash = existing.block_hash;
                out.push(Action::ReportViolation(self.detector.conflicting_preparation(
                    &envelope,
                    existing_hash,
                    response.preparation_hash,
                )));
            }
            return Ok(());
        }

        if self.ctx.not_accepting_payloads_due_to_view_changing() {
            debug!("Ignoring preparation from {} while changing view", index);
            return Ok(());
        }

        let Some(block) = self.ctx.proposed_block() else {
            if self.buffered_responses.len() < self.ctx.n() {
                self.buffered_responses.entry(index).or_insert(envelope);
            }
            debug!("Buffered early preparation from {}", index);
            return Ok(());
        };
        let block_hash = block.hash();

        if response.preparation_hash != block_hash {
            return Err(ConsensusError::InvalidProposal(format!(
                "preparation from {} for {} does not match proposal {}",
                index, response.preparation_hash, block_hash
            )));
        }

        let key = *self
            .ctx
            .validators()
            .get(index)
            .ok_or(ConsensusError::UnauthorizedSender {
                validator: index,
                kind: envelope.kind().to_string(),
            })?;
        if let Err(e) = verify_signature(
            &key,
            &preparation_signing_bytes(&block_hash),
            &response.preparation_signature,
        ) {
            out.push(Action::ReportViolation(
                self.detector.invalid_signature(&envelope, &e),
            ));
            return Err(e);
        }

        self.ctx.record_preparation(
            index,
            Preparation {
                block_hash,
                signature: response.preparation_signature,
                envelope,
            },
        );
        debug!(
            "Preparation from {} ({}/{})",
            index,
            self.ctx.preparations().len(),
            self.ctx.m()
        );

        self.check_preparations(out)
    }

    fn check_preparations(&mut self, out: &mut Vec<Action>) -> Result<()> {
        if self.ctx.watch_only() || !self.ctx.response_sent() || !self.ctx.has_enough_preparations() {
            return Ok(());
        }
        let Some(block_hash) = self.ctx.proposed_block().map(Block::hash) else {
            return Ok(());
        };
        let my_index = self.my_index()?;

        if let Some(mine) = self.ctx.commit(my_index) {
            if mine.block_hash != block_hash {
                return Err(ConsensusError::InvariantViolation(format!(
                    "attempted to commit {} after committing {} at height {}",
                    block_hash,
                    mine.block_hash,
                    self.ctx.block_index()
                )));
            }
            return Ok(());
        }

        self.fsm.prepare()?;

        let block_signature = self.signing_key()?.sign(block_hash.as_bytes());
        let envelope = self.sign_payload(
            Commit {
                block_hash,
                block_signature: block_signature.clone(),
            }
            .into(),
        )?;

        let record = CommitRecord {
            view: self.ctx.view(),
            block_hash,
            signature: block_signature,
            envelope: envelope.clone(),
        };
        if let CommitInsert::Conflict { existing } = self.ctx.record_commit(my_index, record) {
            return Err(ConsensusError::InvariantViolation(format!(
                "own commit for {} conflicts with {}",
                block_hash, existing
            )));
        }
        self.fsm.commit()?;

        info!(
            "Committed block {} at height={} view={}",
            block_hash,
            self.ctx.block_index(),
            self.ctx.view()
        );

        out.push(Action::Broadcast(envelope));
        out.push(Action::SetTimer {
            epoch: self.ctx.epoch(),
            duration: self.settings.view_timeout(self.ctx.view()),
        });

        self.check_commits(out)
    }

    fn on_commit(&mut self, envelope: Envelope, commit: Commit, out: &mut Vec<Action>) -> Result<()> {
        let index = envelope.validator_index;

        if let Some(existing) = self.ctx.commit(index) {
            if existing.block_hash != commit.block_hash {
                let existing_hash = existing.block_hash;
                out.push(Action::ReportViolation(self.detector.conflicting_commit(
                    &envelope,
                    existing_hash,
                    commit.block_hash,
                )));
            }
            return Ok(());
        }

        let key = *self
            .ctx
            .validators()
            .get(index)
            .ok_or(ConsensusError::UnauthorizedSender {
                validator: index,
                kind: envelope.kind().to_string(),
            })?;
        if let Err(e) = verify_signature(&key, commit.block_hash.as_bytes(), &commit.block_signature)
        {
            out.push(Action::ReportViolation(
                self.detector.invalid_signature(&envelope, &e),
            ));
            return Err(e);
        }

        let view = envelope.view;
        self.ctx.record_commit(
            index,
            CommitRecord {
                view,
                block_hash: commit.block_hash,
                signature: commit.block_signature,
                envelope,
            },
        );
        debug!(
            "Commit from {} for {} ({} stored)",
            index,
            commit.block_hash,
            self.ctx.count_committed()
        );

        if view > self.ctx.view() {
            self.request_recovery_once(view, out)?;
        }

        self.check_commits(out)
    }

    fn check_commits(&mut self, out: &mut Vec<Action>) -> Result<()> {
        if self.fsm.is_terminal() {
            return Ok(());
        }
        let Some(quorum) = self.ctx.commit_quorum() else {
            return Ok(());
        };

        match self.ctx.proposed_block() {
            Some(block) if block.hash() == quorum => {
                let finalized = self.ctx.finalize(block).ok_or_else(|| {
                    ConsensusError::InvariantViolation(format!(
                        "commit quorum for {} without M signatures",
                        quorum
                    ))
                })?;
                self.fsm.finalize()?;
                info!(
                    "Block {} finalized at height={} view={} with {} signatures",
                    quorum,
                    self.ctx.block_index(),
                    self.ctx.view(),
                    finalized.signatures.len()
                );
                out.push(Action::PersistBlock(finalized));
                Ok(())
            }
            _ => {
                // Quorum on a proposal we do not hold; fetch it.
                let view = self
                    .ctx
                    .commits()
                    .values()
                    .find(|c| c.block_hash == quorum)
                    .map(|c| c.view)
                    .unwrap_or(self.ctx.view());
                warn!(
                    "Commit quorum for unknown block {} at height={} view={}",
                    quorum,
                    self.ctx.block_index(),
                    view
                );
                self.request_recovery_once(view, out)
            }
        }
    }

    // ---------------------------------------------------------------------
    // View changes
    // ---------------------------------------------------------------------

    fn on_change_view(
        &mut self,
        envelope: Envelope,
        change_view: ChangeView,
        out: &mut Vec<Action>,
    ) -> Result<()> {
        let index = envelope.validator_index;

        // Sender is behind us, or we are locked by our commit.
        if change_view.new_view <= self.ctx.view() || self.ctx.commit_sent() {
            return self.on_recovery_request(&envelope, out);
        }
        if !self.fsm.can_change_view() {
            return Ok(());
        }

        let stored = self.ctx.record_change_view(
            index,
            ChangeViewRecord {
                new_view: change_view.new_view,
                reason: change_view.reason,
                timestamp_ms: change_view.timestamp_ms,
                envelope,
            },
        );
        if stored {
            debug!(
                "Validator {} requests view {} ({})",
                index, change_view.new_view, change_view.reason
            );
            self.check_expected_view(out)?;
        }
        Ok(())
    }

    fn check_expected_view(&mut self, out: &mut Vec<Action>) -> Result<()> {
        let Some(target) = self.ctx.agreed_view() else {
            return Ok(());
        };
        if !self.fsm.can_change_view() {
            return Ok(());
        }

        if !self.ctx.watch_only() && self.ctx.my_change_view().map_or(true, |v| v < target) {
            self.send_change_view(target, ChangeViewReason::ChangeAgreement, out)?;
        }
        self.change_view_to(target, out)
    }

    fn request_change_view(&mut self, reason: ChangeViewReason, out: &mut Vec<Action>) -> Result<()> {
        if self.ctx.watch_only() {
            return Ok(());
        }

        let expected = self.ctx.view().next();
        out.push(Action::SetTimer {
            epoch: self.ctx.epoch(),
            duration: self.settings.view_timeout(expected),
        });

        if self.ctx.more_than_f_committed_or_lost() {
            info!(
                "More than f validators committed or lost at height={}; requesting recovery",
                self.ctx.block_index()
            );
            return self.broadcast_recovery_request(out);
        }

        self.send_change_view(expected, reason, out)?;
        self.check_expected_view(out)
    }

    fn send_change_view(
        &mut self,
        new_view: ViewNumber,
        reason: ChangeViewReason,
        out: &mut Vec<Action>,
    ) -> Result<()> {
        let change_view = ChangeView {
            new_view,
            reason,
            timestamp_ms: self.now_ms,
        };
        let envelope = self.sign_payload(change_view.into())?;
        let my_index = self.my_index()?;

        self.ctx.record_change_view(
            my_index,
            ChangeViewRecord {
                new_view,
                reason,
                timestamp_ms: self.now_ms,
                envelope: envelope.clone(),
            },
        );

        info!(
            "Requesting change view at height={}: {} -> {} ({})",
            self.ctx.block_index(),
            self.ctx.view(),
            new_view,
            reason
        );
        out.push(Action::Broadcast(envelope));
        Ok(())
    }

    fn change_view_to(&mut self, view: ViewNumber, out: &mut Vec<Action>) -> Result<()> {
        self.fsm.change_view(view)?;
        let from = self.ctx.view();
        self.ctx.reset(view);
        self.clear_round();

        info!(
            "View changed at height={}: {} -> {} (primary {})",
            self.ctx.block_index(),
            from,
            view,
            self.ctx.primary_index()
        );

        self.start_round(out)
    }

    // ---------------------------------------------------------------------
    // Recovery
    // ---------------------------------------------------------------------

    fn request_recovery_once(&mut self, view: ViewNumber, out: &mut Vec<Action>) -> Result<()> {
        if self.ctx.watch_only() || !self.recovery_requested.insert(view) {
            return Ok(());
        }
        debug!(
            "Requesting recovery for height={} view={}",
            self.ctx.block_index(),
            view
        );
        self.broadcast_recovery_request(out)
    }

    fn broadcast_recovery_request(&mut self, out: &mut Vec<Action>) -> Result<()> {
        let envelope = self.sign_payload(
            RecoveryRequest {
                timestamp_ms: self.now_ms,
            }
            .into(),
        )?;
        out.push(Action::Broadcast(envelope));
        Ok(())
    }

    /// Committed nodes always answer. Otherwise only the f+1 validators
    /// following the requester do, which bounds the reply traffic.
    fn should_answer_recovery(&self, requester: ValidatorIndex) -> bool {
        let Some(my_index) = self.ctx.my_index() else {
            return false;
        };
        if self.ctx.commit_sent() {
            return true;
        }
        let n = self.ctx.n();
        (1..=self.ctx.f() + 1).any(|i| (requester.as_usize() + i) % n == my_index.as_usize())
    }

    fn on_recovery_request(&mut self, envelope: &Envelope, out: &mut Vec<Action>) -> Result<()> {
        let requester = envelope.validator_index;
        if !self.should_answer_recovery(requester) {
            return Ok(());
        }

        let message = self.make_recovery_message();
        debug!(
            "Answering recovery for validator {} with {} entries",
            requester,
            message.len()
        );
        let envelope = self.sign_payload(message.into())?;
        out.push(Action::SendTo {
            validator: requester,
            envelope,
        });
        Ok(())
    }

    fn make_recovery_message(&self) -> RecoveryMessage {
        let change_views = self
            .ctx
            .change_views()
            .values()
            .take(self.ctx.m())
            .filter_map(|cv| match &cv.envelope.payload {
                ConsensusPayload::ChangeView(p) => Some(cv.envelope.recovered(p.clone())),
                _ => None,
            })
            .collect();

        let prepare_request = self
            .ctx
            .prepare_request()
            .and_then(|envelope| match &envelope.payload {
                ConsensusPayload::PrepareRequest(p) => Some(envelope.recovered(p.clone())),
                _ => None,
            });

        let prepare_responses = self
            .ctx
            .preparations()
            .values()
            .filter_map(|p| match &p.envelope.payload {
                ConsensusPayload::PrepareResponse(r) => Some(p.envelope.recovered(r.clone())),
                _ => None,
            })
            .collect();

        let commits = if self.ctx.commit_sent() {
            self.ctx
                .commits()
                .values()
                .filter_map(|c| match &c.envelope.payload {
                    ConsensusPayload::Commit(p) => Some(c.envelope.recovered(p.clone())),
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };

        RecoveryMessage {
            change_views,
            prepare_request,
            prepare_responses,
            commits,
        }
    }

    fn on_recovery_message(
        &mut self,
        envelope: &Envelope,
        message: RecoveryMessage,
        out: &mut Vec<Action>,
    ) -> Result<()> {
        debug!(
            "Recovery from {} (view {}) with {} entries",
            envelope.validator_index,
            envelope.view,
            message.len()
        );

        for inner in message.into_envelopes(envelope.block_index) {
            // Old change views in a snapshot are history, not requests to answer.
            if let ConsensusPayload::ChangeView(cv) = &inner.payload {
                if cv.new_view <= self.ctx.view() || self.ctx.commit_sent() {
                    continue;
                }
            }
            Self::absorb(self.on_envelope(inner, out))?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn build_block(&self, request: &PrepareRequest, primary: ValidatorIndex) -> Block {
        Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_hash: self.ctx.prev_hash(),
                index: self.ctx.block_index(),
                timestamp_ms: request.timestamp_ms,
                nonce: request.nonce,
                next_consensus: request.next_consensus,
                primary_index: primary,
                merkle_root: merkle_root(&request.transaction_hashes),
            },
            transactions: request.transaction_hashes.clone(),
        }
    }

    fn my_index(&self) -> Result<ValidatorIndex> {
        self.ctx.my_index().ok_or_else(|| {
            ConsensusError::InvariantViolation("watch-only node attempted to sign".to_string())
        })
    }

    fn signing_key(&self) -> Result<&KeyPair> {
        self.key.as_ref().ok_or_else(|| {
            ConsensusError::InvariantViolation("no signing key configured".to_string())
        })
    }

    fn sign_payload(&self, payload: ConsensusPayload) -> Result<Envelope> {
        let index = self.my_index()?;
        Envelope::new_signed(
            self.ctx.block_index(),
            index,
            self.ctx.view(),
            payload,
            self.signing_key()?,
        )
    }

    pub fn block_index(&self) -> BlockIndex {
        self.ctx.block_index()
    }
}
