use crate::config::AppConfig;
use dbft_consensus::{Collaborators, ConsensusService, Network};
use dbft_crypto::KeyPair;
use dbft_network::TcpMesh;
use dbft_storage::{MemoryLedger, MemoryMempool, StaticVerifier};
use dbft_types::{ChainTip, ConsensusError, ConsensusSettings, ValidatorSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const INBOUND_QUEUE: usize = 1024;
const STATUS_EVERY_TICKS: u64 = 10;

pub struct DbftNode {
    config: AppConfig,
    settings: ConsensusSettings,
    validators: ValidatorSet,
    key: Option<KeyPair>,
}

impl DbftNode {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let settings = config.consensus_settings()?;
        let validators = config.validator_set()?;
        let key = config.key_pair()?;

        info!("Initializing dBFT node {}", config.node.index);
        info!(
            "Validators: {} (f={}, M={})",
            validators.len(),
            validators.f(),
            validators.m()
        );
        info!("Block time: {}ms", settings.block_time_ms);
        match &key {
            Some(key) => info!("Node public key: {}", key.public_key()),
            None => info!("Watch-only mode, no signing key"),
        }

        Ok(Self {
            config,
            settings,
            validators,
            key,
        })
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn key(&self) -> Option<&KeyPair> {
        self.key.as_ref()
    }

    /// Runs until Ctrl-C or until consensus halts.
    pub async fn run(self) -> anyhow::Result<()> {
        let genesis = ChainTip::genesis(self.config.genesis.timestamp_ms);
        let ledger = Arc::new(MemoryLedger::new(genesis, self.validators.clone()));
        let mempool = Arc::new(MemoryMempool::new());
        let verifier = Arc::new(StaticVerifier::new());

        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let mesh = Arc::new(TcpMesh::new(
            self.config.node_index(),
            self.config.peers()?,
            inbound_tx,
        ));

        let listen_addr = self.config.listen_addr()?;
        mesh.listen_on(listen_addr).await?;

        let reconnect = Duration::from_secs(self.config.network.reconnect_interval_secs.max(1));
        let maintenance = tokio::spawn(Arc::clone(&mesh).maintain_connections(reconnect));

        let network: Arc<dyn Network> = mesh.clone();
        let collaborators = Collaborators {
            network,
            verifier,
            mempool,
            ledger: ledger.clone(),
        };

        let mut service = ConsensusService::new(self.settings.clone(), self.key.clone(), collaborators);
        service.start().await?;

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.network.tick_interval_ms));
        let mut ticks: u64 = 0;
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                Some(bytes) = inbound_rx.recv() => {
                    match service.on_message(&bytes).await {
                        Ok(()) => {}
                        Err(ConsensusError::ServiceStopped) => break,
                        Err(e) => warn!("Dropped inbound message: {}", e),
                    }
                }

                _ = tick.tick() => {
                    if let Err(ConsensusError::ServiceStopped) = service.on_tick().await {
                        break;
                    }

                    ticks += 1;
                    if ticks % STATUS_EVERY_TICKS == 0 {
                        let peers = mesh.connected_peers().await;
                        if let Some(status) = service.status() {
                            info!(
                                "Status: height={} view={} state={:?} primary={} peers={}",
                                status.block_index,
                                status.view,
                                status.round_state,
                                status.primary,
                                peers.len()
                            );
                        }
                        debug!("Ledger holds {} blocks", ledger.blocks().await.len());
                    }
                }
            }
        }

        maintenance.abort();
        service.stop().await?;
        info!("Node stopped");

        Ok(())
    }
}
