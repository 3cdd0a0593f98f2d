//! dBFT consensus for a permissioned validator set
//!
//! N validators agree on one block per height while tolerating
//! f = ⌊(N-1)/3⌋ byzantine members. It provides:
//!
//! - **Message Codec**: Framed, versioned binary encoding of signed
//!   consensus envelopes. Decoding never panics on hostile input.
//!
//! - **Consensus Context**: Per-height bookkeeping of the proposal,
//!   preparations, commits and change-view requests. Commits survive view
//!   changes and are write-once per validator.
//!
//! - **Round State Machine**: Sans-IO dBFT rules:
//!   Initial -> PrimarySent/BackupWaiting -> Prepared -> Committed -> Finalized
//!   with change-view and recovery paths
//!
//! - **Byzantine Detection**: Evidence for invalid signatures, conflicting
//!   commits, preparations and proposals, and proposals from non-primaries
//!
//! - **Consensus Service**: Tokio task that drives the state machine
//!   against the network, mempool, verifier and ledger
//!
//! # Example
//!
//! ```no_run
//! use dbft_consensus::{Collaborators, ConsensusService};
//! use dbft_crypto::KeyPair;
//! use dbft_types::ConsensusSettings;
//!
//! # async fn example(collaborators: Collaborators) -> dbft_types::Result<()> {
//! let key = KeyPair::from_seed("validator-0");
//! let mut service = ConsensusService::new(ConsensusSettings::default(), Some(key), collaborators);
//! service.start().await?;
//!
//! // Feed raw bytes received from peers
//! // service.on_message(&bytes).await?;
//! # service.stop().await
//! # }
//! ```

pub mod byzantine;
pub mod codec;
pub mod context;
pub mod fsm;
pub mod messages;
pub mod service;
pub mod state_machine;
pub mod timer;
pub mod traits;

// Re-export main types
pub use byzantine::ByzantineDetector;
pub use codec::{decode, encode, DecodeError, MAX_MESSAGE_SIZE};
pub use context::{ConsensusContext, Epoch};
pub use fsm::{RoundFsm, RoundState};
pub use messages::{
    ChangeView, Commit, ConsensusPayload, Envelope, PayloadKind, PrepareRequest, PrepareResponse,
    Recovered, RecoveryMessage, RecoveryRequest,
};
pub use service::{ConsensusService, ServiceStatus};
pub use state_machine::{Action, ConsensusStateMachine, Event, VerificationResult};
pub use traits::{
    Collaborators, LedgerStorage, Mempool, Network, PersistOutcome, TransactionVerifier,
};
