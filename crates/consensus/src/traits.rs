use std::sync::Arc;

use async_trait::async_trait;
use dbft_types::{ChainTip, FinalizedBlock, Hash256, Result, ValidatorIndex, ValidatorSet};
#[cfg(test)]
use mockall::automock;

use crate::messages::Envelope;

/// Outcome of handing a finalized block to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted,
    /// The ledger refused the block. The service keeps retrying with backoff
    /// until the block is accepted or the ledger tip passes its height.
    Rejected(String),
}

/// Delivery of consensus envelopes to the other validators. Best effort:
/// lost messages are recovered by timeouts and recovery requests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Network: Send + Sync {
    async fn broadcast(&self, envelope: &Envelope) -> Result<()>;

    async fn send_to(&self, validator: ValidatorIndex, envelope: &Envelope) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransactionVerifier: Send + Sync {
    /// Whether the transaction is known and valid against the current tip.
    async fn is_valid_transaction(&self, hash: &Hash256) -> bool;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Mempool: Send + Sync {
    /// Up to `max_count` candidate transactions for the next block.
    async fn candidates(&self, max_count: usize) -> Vec<Hash256>;

    /// Drops transactions included in a persisted block.
    async fn remove(&self, hashes: &[Hash256]);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    async fn current_tip(&self) -> Result<ChainTip>;

    /// Validator set responsible for the block after `tip`.
    async fn validators(&self, tip: &ChainTip) -> Result<ValidatorSet>;

    async fn persist_block(&self, block: &FinalizedBlock) -> Result<PersistOutcome>;
}

/// Everything the service talks to besides its own state.
#[derive(Clone)]
pub struct Collaborators {
    pub network: Arc<dyn Network>,
    pub verifier: Arc<dyn TransactionVerifier>,
    pub mempool: Arc<dyn Mempool>,
    pub ledger: Arc<dyn LedgerStorage>,
}
