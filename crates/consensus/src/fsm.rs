use dbft_types::{BlockIndex, ConsensusError, Result, ViewNumber};
use std::fmt;
use tracing::info;

/// Phase of the current round. View changing is tracked separately on the
/// context because it overlays any pre-commit phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// Round started, nothing proposed yet.
    Initial,
    /// This node is primary and broadcast its proposal.
    PrimarySent,
    /// This node is a backup (or watcher) waiting for the proposal.
    BackupWaiting,
    /// Proposal plus M preparations seen.
    Prepared,
    /// This node broadcast its commit. Never leaves the view afterwards.
    Committed,
    /// M commits collected and the block handed to storage.
    Finalized,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundState::Initial => write!(f, "INITIAL"),
            RoundState::PrimarySent => write!(f, "PRIMARY_SENT"),
            RoundState::BackupWaiting => write!(f, "BACKUP_WAITING"),
            RoundState::Prepared => write!(f, "PREPARED"),
            RoundState::Committed => write!(f, "COMMITTED"),
            RoundState::Finalized => write!(f, "FINALIZED"),
        }
    }
}

pub struct RoundFsm {
    current_state: RoundState,
    block_index: BlockIndex,
    view: ViewNumber,
}

impl RoundFsm {
    pub fn new(block_index: BlockIndex) -> Self {
        Self {
            current_state: RoundState::Initial,
            block_index,
            view: ViewNumber(0),
        }
    }

    pub fn current_state(&self) -> RoundState {
        self.current_state
    }

    pub fn send_proposal(&mut self) -> Result<()> {
        self.transition(RoundState::PrimarySent, &[RoundState::Initial])
    }

    pub fn wait_for_proposal(&mut self) -> Result<()> {
        self.transition(RoundState::BackupWaiting, &[RoundState::Initial])
    }

    pub fn prepare(&mut self) -> Result<()> {
        self.transition(
            RoundState::Prepared,
            &[RoundState::PrimarySent, RoundState::BackupWaiting],
        )
    }

    pub fn commit(&mut self) -> Result<()> {
        self.transition(RoundState::Committed, &[RoundState::Prepared])
    }

    /// Any node holding the proposal may finalize once M commits agree, even
    /// without having committed itself.
    pub fn finalize(&mut self) -> Result<()> {
        self.transition(
            RoundState::Finalized,
            &[
                RoundState::PrimarySent,
                RoundState::BackupWaiting,
                RoundState::Prepared,
                RoundState::Committed,
            ],
        )
    }

    /// Restart the round in `view`. A committed node stays in its view.
    pub fn change_view(&mut self, view: ViewNumber) -> Result<()> {
        self.transition(
            RoundState::Initial,
            &[
                RoundState::Initial,
                RoundState::PrimarySent,
                RoundState::BackupWaiting,
                RoundState::Prepared,
            ],
        )?;
        self.view = view;
        Ok(())
    }

    /// New height. Always allowed.
    pub fn advance(&mut self, block_index: BlockIndex) {
        info!(
            "Round advance: height {} -> {} (was {})",
            self.block_index, block_index, self.current_state
        );
        self.block_index = block_index;
        self.view = ViewNumber(0);
        self.current_state = RoundState::Initial;
    }

    fn transition(&mut self, new_state: RoundState, allowed_from: &[RoundState]) -> Result<()> {
        if !allowed_from.contains(&self.current_state) {
            return Err(ConsensusError::InvalidTransition(format!(
                "height={} view={}: {} -> {}. Allowed from: {:?}",
                self.block_index, self.view, self.current_state, new_state, allowed_from
            )));
        }

        info!(
            "State transition at height={} view={}: {} -> {}",
            self.block_index, self.view, self.current_state, new_state
        );

        self.current_state = new_state;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.current_state, RoundState::Finalized)
    }

    pub fn can_change_view(&self) -> bool {
        !matches!(
            self.current_state,
            RoundState::Committed | RoundState::Finalized
        )
    }
}
