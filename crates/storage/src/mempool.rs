use async_trait::async_trait;
use dbft_consensus::{Mempool, TransactionVerifier};
use dbft_types::Hash256;
use std::collections::{HashSet, VecDeque};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Default)]
struct Pool {
    order: VecDeque<Hash256>,
    known: HashSet<Hash256>,
}

/// FIFO pool of pending transaction hashes.
#[derive(Default)]
pub struct MemoryMempool {
    pool: Mutex<Pool>,
}

impl MemoryMempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transaction. Returns false if it was already pending.
    pub async fn submit(&self, hash: Hash256) -> bool {
        let mut pool = self.pool.lock().await;
        if !pool.known.insert(hash) {
            return false;
        }
        pool.order.push_back(hash);
        true
    }

    pub async fn len(&self) -> usize {
        self.pool.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Mempool for MemoryMempool {
    async fn candidates(&self, max_count: usize) -> Vec<Hash256> {
        let pool = self.pool.lock().await;
        pool.order.iter().take(max_count).copied().collect()
    }

    async fn remove(&self, hashes: &[Hash256]) {
        let mut pool = self.pool.lock().await;
        let included: HashSet<&Hash256> = hashes.iter().collect();
        pool.order.retain(|h| !included.contains(h));
        for hash in hashes {
            pool.known.remove(hash);
        }
        debug!("Mempool pruned {} transactions, {} pending", hashes.len(), pool.order.len());
    }
}

/// Treats every transaction as valid except an explicit deny list.
#[derive(Default)]
pub struct StaticVerifier {
    rejected: RwLock<HashSet<Hash256>>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reject(&self, hash: Hash256) {
        self.rejected.write().await.insert(hash);
    }
}

#[async_trait]
impl TransactionVerifier for StaticVerifier {
    async fn is_valid_transaction(&self, hash: &Hash256) -> bool {
        !self.rejected.read().await.contains(hash)
    }
}
