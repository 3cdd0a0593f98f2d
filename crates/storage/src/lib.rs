//! In-memory ledger, mempool and transaction verifier.
//!
//! Reference implementations of the collaborator traits the consensus
//! service needs. Used by the `dbft-node` binary and by end-to-end tests.

pub mod ledger;
pub mod mempool;

pub use ledger::MemoryLedger;
pub use mempool::{MemoryMempool, StaticVerifier};
