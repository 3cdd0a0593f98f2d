use async_trait::async_trait;
use dbft_consensus::{LedgerStorage, PersistOutcome};
use dbft_crypto::verify_signature;
use dbft_types::{ChainTip, FinalizedBlock, Hash256, Result, ValidatorSet};
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct LedgerState {
    genesis: ChainTip,
    blocks: Vec<FinalizedBlock>,
}

impl LedgerState {
    fn tip(&self) -> ChainTip {
        match self.blocks.last() {
            Some(block) => ChainTip {
                height: block.index(),
                hash: block.hash(),
                timestamp_ms: block.block.header.timestamp_ms,
            },
            None => self.genesis,
        }
    }
}

/// Append-only chain of finalized blocks with a fixed validator set.
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
    validators: ValidatorSet,
}

impl MemoryLedger {
    pub fn new(genesis: ChainTip, validators: ValidatorSet) -> Self {
        Self {
            state: RwLock::new(LedgerState {
                genesis,
                blocks: Vec::new(),
            }),
            validators,
        }
    }

    pub async fn blocks(&self) -> Vec<FinalizedBlock> {
        self.state.read().await.blocks.clone()
    }

    pub async fn block_hash(&self, height: u32) -> Option<Hash256> {
        let state = self.state.read().await;
        let index = (height as usize).checked_sub(1)?;
        state.blocks.get(index).map(FinalizedBlock::hash)
    }

    /// Checks linkage to `tip` and that M distinct validators signed.
    fn check(&self, tip: &ChainTip, block: &FinalizedBlock) -> std::result::Result<(), String> {
        if block.index() != tip.height.next() {
            return Err(format!(
                "expected height {}, got {}",
                tip.height.next(),
                block.index()
            ));
        }

        if block.block.header.prev_hash != tip.hash {
            return Err(format!(
                "prev_hash {} does not match tip {}",
                block.block.header.prev_hash, tip.hash
            ));
        }

        if block.block.header.timestamp_ms <= tip.timestamp_ms {
            return Err(format!(
                "timestamp {} not after tip {}",
                block.block.header.timestamp_ms, tip.timestamp_ms
            ));
        }

        let hash = block.hash();
        let mut signers = HashSet::new();
        for sig in &block.signatures {
            let key = self
                .validators
                .get(sig.validator_index)
                .ok_or_else(|| format!("unknown signer {}", sig.validator_index))?;
            verify_signature(key, hash.as_bytes(), &sig.signature)
                .map_err(|_| format!("bad signature from {}", sig.validator_index))?;
            signers.insert(sig.validator_index);
        }

        if signers.len() < self.validators.m() {
            return Err(format!(
                "{} distinct signatures, need {}",
                signers.len(),
                self.validators.m()
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl LedgerStorage for MemoryLedger {
    async fn current_tip(&self) -> Result<ChainTip> {
        Ok(self.state.read().await.tip())
    }

    async fn validators(&self, _tip: &ChainTip) -> Result<ValidatorSet> {
        Ok(self.validators.clone())
    }

    async fn persist_block(&self, block: &FinalizedBlock) -> Result<PersistOutcome> {
        let mut state = self.state.write().await;
        let tip = state.tip();

        // Same block delivered twice.
        if block.index() == tip.height && block.hash() == tip.hash {
            return Ok(PersistOutcome::Persisted);
        }

        if let Err(reason) = self.check(&tip, block) {
            warn!("Rejecting block {} at height {}: {}", block.hash(), block.index(), reason);
            return Ok(PersistOutcome::Rejected(reason));
        }

        state.blocks.push(block.clone());
        info!(
            "Ledger height {} -> {} (block {})",
            tip.height,
            block.index(),
            block.hash()
        );
        Ok(PersistOutcome::Persisted)
    }
}
