//! Async driver for the round state machine.
//!
//! A single tokio task owns the [`ConsensusStateMachine`] and processes
//! inputs strictly one at a time: decoded envelopes and ledger ticks from the
//! [`ConsensusService`] handle, plus timer fires and mempool/verifier results
//! produced by work it spawned itself. Actions returned by the state machine
//! are executed against the [`Collaborators`].

use std::collections::VecDeque;
use std::time::Duration;

use dbft_crypto::KeyPair;
use dbft_types::{
    now_ms, BlockIndex, ConsensusError, ConsensusSettings, FinalizedBlock, Hash256, Result,
    ValidatorIndex, ViewNumber,
};
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::fsm::RoundState;
use crate::messages::Envelope;
use crate::state_machine::{Action, ConsensusStateMachine, Event, VerificationResult};
use crate::timer::RoundTimer;
use crate::traits::{Collaborators, Mempool, PersistOutcome, TransactionVerifier};

const COMMAND_QUEUE: usize = 1024;
const EVENT_QUEUE: usize = 256;

enum Command {
    Envelope(Envelope),
    Tick,
}

/// Snapshot of the running service, refreshed after every processed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub running: bool,
    pub halted: bool,
    pub block_index: BlockIndex,
    pub view: ViewNumber,
    pub round_state: RoundState,
    pub primary: ValidatorIndex,
    pub my_index: Option<ValidatorIndex>,
    pub preparations: usize,
    pub commits: usize,
    pub violations: u64,
}

impl ServiceStatus {
    fn from_machine(machine: &ConsensusStateMachine, running: bool, halted: bool) -> Self {
        let ctx = machine.context();
        Self {
            running,
            halted,
            block_index: ctx.block_index(),
            view: ctx.view(),
            round_state: machine.state(),
            primary: ctx.primary_index(),
            my_index: ctx.my_index(),
            preparations: ctx.preparations().len(),
            commits: ctx.count_committed(),
            violations: machine.detector().total_violations(),
        }
    }
}

pub struct ConsensusService {
    settings: ConsensusSettings,
    key: Option<KeyPair>,
    collaborators: Collaborators,
    command_tx: Option<mpsc::Sender<Command>>,
    status_rx: Option<watch::Receiver<ServiceStatus>>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl ConsensusService {
    /// `key` is `None` for a watch-only node.
    pub fn new(
        settings: ConsensusSettings,
        key: Option<KeyPair>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            settings,
            key,
            collaborators,
            command_tx: None,
            status_rx: None,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    /// Loads the tip from the ledger and starts the consensus task.
    pub async fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(ConsensusError::InvalidTransition(
                "consensus service already started".to_string(),
            ));
        }
        self.settings.validate()?;

        let tip = self.collaborators.ledger.current_tip().await?;
        let validators = self.collaborators.ledger.validators(&tip).await?;
        info!(
            "Starting consensus at height {} with {} validators (f={}, M={})",
            tip.height.next(),
            validators.len(),
            validators.f(),
            validators.m()
        );

        let machine = ConsensusStateMachine::new(
            self.settings.clone(),
            self.key.clone(),
            tip,
            validators,
            now_ms(),
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (status_tx, status_rx) =
            watch::channel(ServiceStatus::from_machine(&machine, true, false));

        self.shutdown = CancellationToken::new();
        let worker = Worker {
            timer: RoundTimer::new(event_tx.clone()),
            machine,
            settings: self.settings.clone(),
            collaborators: self.collaborators.clone(),
            tasks: JoinSet::new(),
            event_tx,
            status_tx,
            shutdown: self.shutdown.clone(),
        };

        self.task = Some(tokio::spawn(worker.run(command_rx, event_rx)));
        self.command_tx = Some(command_tx);
        self.status_rx = Some(status_rx);
        Ok(())
    }

    /// Stops the task. Returns the fatal error if consensus had halted.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        self.command_tx = None;

        let Some(task) = self.task.take() else {
            return Ok(());
        };
        info!("Stopping consensus service");
        task.await.map_err(|e| {
            ConsensusError::InvariantViolation(format!("consensus task failed: {}", e))
        })?
    }

    /// Queues a raw message from a peer. Malformed bytes are rejected here.
    pub async fn on_message(&self, bytes: &[u8]) -> Result<()> {
        let envelope = codec::decode(bytes)?;
        self.send(Command::Envelope(envelope)).await
    }

    /// Asks the service to check whether the ledger moved past the current
    /// height, e.g. because the block was synced from elsewhere.
    pub async fn on_tick(&self) -> Result<()> {
        self.send(Command::Tick).await
    }

    pub fn status(&self) -> Option<ServiceStatus> {
        self.status_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Status receiver for callers that want to await changes.
    pub fn subscribe(&self) -> Option<watch::Receiver<ServiceStatus>> {
        self.status_rx.clone()
    }

    async fn send(&self, command: Command) -> Result<()> {
        let tx = self.command_tx.as_ref().ok_or(ConsensusError::ServiceStopped)?;
        tx.send(command)
            .await
            .map_err(|_| ConsensusError::ServiceStopped)
    }
}

impl Drop for ConsensusService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Mempool candidates the verifier accepts. Rejected transactions are
/// dropped from the mempool so no later primary proposes them again.
async fn verified_candidates(
    mempool: &dyn Mempool,
    verifier: &dyn TransactionVerifier,
    max_count: usize,
) -> Vec<Hash256> {
    let candidates = mempool.candidates(max_count).await;
    let verdicts = join_all(candidates.iter().map(|h| verifier.is_valid_transaction(h))).await;

    let (valid, invalid): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .zip(verdicts)
        .partition(|(_, is_valid)| *is_valid);

    if !invalid.is_empty() {
        let invalid: Vec<Hash256> = invalid.into_iter().map(|(hash, _)| hash).collect();
        warn!(
            "Dropping {} invalid transactions from the mempool",
            invalid.len()
        );
        mempool.remove(&invalid).await;
    }

    valid.into_iter().map(|(hash, _)| hash).collect()
}

struct Worker {
    machine: ConsensusStateMachine,
    settings: ConsensusSettings,
    collaborators: Collaborators,
    timer: RoundTimer,
    /// Mempool and verifier calls for the current height.
    tasks: JoinSet<()>,
    event_tx: mpsc::Sender<Event>,
    status_tx: watch::Sender<ServiceStatus>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut event_rx: mpsc::Receiver<Event>,
    ) -> Result<()> {
        let result = self.process(&mut command_rx, &mut event_rx).await;

        self.timer.cancel();
        self.tasks.abort_all();
        let halted = result.is_err();
        self.status_tx
            .send_replace(ServiceStatus::from_machine(&self.machine, false, halted));

        match &result {
            Ok(()) => info!("Consensus service stopped"),
            Err(e) => error!("Consensus service halted: {}", e),
        }
        result
    }

    async fn process(
        &mut self,
        command_rx: &mut mpsc::Receiver<Command>,
        event_rx: &mut mpsc::Receiver<Event>,
    ) -> Result<()> {
        self.dispatch(Event::Start).await?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),

                command = command_rx.recv() => match command {
                    Some(Command::Envelope(envelope)) => {
                        self.dispatch(Event::Envelope(envelope)).await?
                    }
                    Some(Command::Tick) => {
                        if let Some(actions) = self.advance_from_ledger().await? {
                            self.execute(actions).await?;
                        }
                    }
                    None => return Ok(()),
                },

                Some(event) = event_rx.recv() => self.dispatch(event).await?,

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            warn!("Background consensus task failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, event: Event) -> Result<()> {
        let actions = self.machine.handle(event, now_ms())?;
        self.execute(actions).await
    }

    async fn execute(&mut self, actions: Vec<Action>) -> Result<()> {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Broadcast(envelope) => {
                    if let Err(e) = self.collaborators.network.broadcast(&envelope).await {
                        warn!("Broadcast of {} failed: {}", envelope, e);
                    }
                }
                Action::SendTo {
                    validator,
                    envelope,
                } => {
                    if let Err(e) = self.collaborators.network.send_to(validator, &envelope).await {
                        warn!("Send of {} to validator {} failed: {}", envelope, validator, e);
                    }
                }
                Action::SetTimer { epoch, duration } => self.timer.set(epoch, duration),
                Action::CollectCandidates { epoch, max_count } => {
                    let mempool = self.collaborators.mempool.clone();
                    let verifier = self.collaborators.verifier.clone();
                    let event_tx = self.event_tx.clone();
                    self.tasks.spawn(async move {
                        let hashes =
                            verified_candidates(mempool.as_ref(), verifier.as_ref(), max_count)
                                .await;
                        let _ = event_tx.send(Event::CandidatesReady { epoch, hashes }).await;
                    });
                }
                Action::VerifyTransactions { epoch, hashes } => {
                    let verifier = self.collaborators.verifier.clone();
                    let event_tx = self.event_tx.clone();
                    self.tasks.spawn(async move {
                        let verdicts =
                            join_all(hashes.iter().map(|h| verifier.is_valid_transaction(h))).await;
                        let result = hashes
                            .iter()
                            .zip(verdicts)
                            .find(|(_, valid)| !valid)
                            .map(|(hash, _)| VerificationResult::Invalid { hash: *hash })
                            .unwrap_or(VerificationResult::Valid);
                        let _ = event_tx
                            .send(Event::TransactionsVerified { epoch, result })
                            .await;
                    });
                }
                Action::PersistBlock(block) => {
                    if let Some(actions) = self.persist(block).await? {
                        queue.extend(actions);
                    }
                }
                Action::ReportViolation(violation) => {
                    debug!(
                        "Violation by validator {}: {}",
                        violation.validator_index, violation.violation_type
                    );
                }
            }
        }

        self.publish_status();
        Ok(())
    }

    /// Hands a finalized block to the ledger, retrying errors and rejections
    /// with exponential backoff. Consensus is never re-run for an agreed
    /// block: the loop ends on success, on shutdown, or once the ledger tip
    /// reached the block's height by other means. Returns the actions of the
    /// next height once the ledger advanced.
    async fn persist(&mut self, block: FinalizedBlock) -> Result<Option<Vec<Action>>> {
        let mut delay = Duration::from_millis(self.settings.persist_retry_base_ms);
        let max_delay = Duration::from_millis(self.settings.persist_retry_max_ms);

        loop {
            let failure = match self.collaborators.ledger.persist_block(&block).await {
                Ok(PersistOutcome::Persisted) => {
                    info!(
                        "Persisted block {} at height {} ({} transactions)",
                        block.hash(),
                        block.index(),
                        block.block.transactions.len()
                    );
                    self.collaborators
                        .mempool
                        .remove(&block.block.transactions)
                        .await;
                    return self.advance_from_ledger().await;
                }
                Ok(PersistOutcome::Rejected(reason)) => ConsensusError::StorageRejected {
                    block_index: block.index(),
                    reason,
                },
                Err(e) => e,
            };

            if self.ledger_reached(block.index()).await {
                info!(
                    "Ledger already holds height {}; dropping local block {}",
                    block.index(),
                    block.hash()
                );
                return self.advance_from_ledger().await;
            }

            match &failure {
                ConsensusError::StorageRejected { .. } => {
                    error!("{}. Retrying in {:?}", failure, delay)
                }
                _ => warn!(
                    "Persisting block {} failed: {}. Retrying in {:?}",
                    block.index(),
                    failure,
                    delay
                ),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(max_delay);
        }
    }

    async fn ledger_reached(&self, height: BlockIndex) -> bool {
        match self.collaborators.ledger.current_tip().await {
            Ok(tip) => tip.height >= height,
            Err(_) => false,
        }
    }

    /// Moves to the next height if the ledger tip reached the current one.
    async fn advance_from_ledger(&mut self) -> Result<Option<Vec<Action>>> {
        let tip = match self.collaborators.ledger.current_tip().await {
            Ok(tip) => tip,
            Err(e) => {
                warn!("Reading ledger tip failed: {}", e);
                return Ok(None);
            }
        };

        if tip.height < self.machine.block_index() {
            return Ok(None);
        }

        let validators = match self.collaborators.ledger.validators(&tip).await {
            Ok(validators) => validators,
            Err(e) => {
                warn!("Reading validators after height {} failed: {}", tip.height, e);
                return Ok(None);
            }
        };

        // Pending work belongs to the height we are leaving.
        self.tasks.abort_all();
        self.timer.cancel();

        let actions = self.machine.advance(tip, validators, now_ms())?;
        self.publish_status();
        Ok(Some(actions))
    }

    fn publish_status(&self) {
        self.status_tx
            .send_replace(ServiceStatus::from_machine(&self.machine, true, false));
    }
}
