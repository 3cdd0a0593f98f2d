mod app;
mod cli;
mod config;

use app::DbftNode;
use clap::Parser;
use cli::{Cli, Commands, LogFormat};
use config::AppConfig;
use dbft_consensus::{encode, ChangeView, ConsensusPayload, Envelope};
use dbft_crypto::KeyPair;
use dbft_types::{now_ms, BlockIndex, ChangeViewReason, ViewNumber};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing("info", cli.log_format);

    if let Err(e) = run(cli).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Keygen) => {
            keygen();
            return Ok(());
        }
        Some(Commands::EncodeSample { height }) => {
            let config = load_config(&cli)?;
            return encode_sample(config, height);
        }
        _ => {}
    }

    let config = load_config(&cli)?;
    match cli.command {
        Some(Commands::Info) => show_info(config),
        _ => run_node(config).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    info!("Loading configuration...");
    let config = AppConfig::load(cli.config.as_deref()).map_err(|e| {
        error!("Failed to load config: {}", e);
        e
    })?;

    info!("Configuration loaded successfully");
    info!("  Node index:  {}", config.node.index);
    info!("  Listen addr: {}", config.node.listen_addr);
    info!("  Peers:       {}", config.network.peers.len());

    Ok(config)
}

async fn run_node(config: AppConfig) -> anyhow::Result<()> {
    info!("===================================");
    info!("dBFT Consensus Node");
    info!("===================================");

    let node = DbftNode::new(config)?;
    node.run().await
}

fn keygen() {
    let key = KeyPair::generate();

    println!("\nNew validator key");
    println!("─────────────────────────────────────");
    println!("  Public key:  {}", hex::encode(key.public_key().as_bytes()));
    println!("  Private key: {}", hex::encode(key.private_key()));
    println!("\nSet PRIVATE_KEY_HEX on the node and add the public key to genesis.validator_keys");
}

fn show_info(config: AppConfig) -> anyhow::Result<()> {
    let node = DbftNode::new(config.clone())?;
    let validators = node.validators();

    println!("\nNode Information");
    println!("─────────────────────────────────────");
    println!("  Index:       {}", config.node.index);
    println!("  Listen:      {}", config.node.listen_addr);
    match node.key() {
        Some(key) => println!("  Public Key:  {}", hex::encode(key.public_key().as_bytes())),
        None => println!("  Public Key:  (watch-only)"),
    }

    println!("\nConsensus Configuration");
    println!("─────────────────────────────────────");
    println!("  Validators:  {}", validators.len());
    println!("  Faulty (f):  {}", validators.f());
    println!("  Quorum (M):  {}", validators.m());
    println!("  Block time:  {}ms", config.consensus.block_time_ms);
    println!("  Max txs:     {}", config.consensus.max_transactions_per_block);

    println!("\nValidator Set");
    println!("─────────────────────────────────────");
    for (index, key) in validators.iter() {
        let marker = if index == config.node_index() { "*" } else { " " };
        println!("  {} {:>3}  {}", marker, index, hex::encode(key.as_bytes()));
    }

    Ok(())
}

fn encode_sample(config: AppConfig, height: u32) -> anyhow::Result<()> {
    let key = config
        .key_pair()?
        .ok_or_else(|| anyhow::anyhow!("watch-only node has no key to sign a sample"))?;

    let payload = ConsensusPayload::ChangeView(ChangeView {
        new_view: ViewNumber(1),
        reason: ChangeViewReason::Timeout,
        timestamp_ms: now_ms(),
    });
    let envelope = Envelope::new_signed(BlockIndex(height), config.node_index(), ViewNumber(0), payload, &key)?;
    let bytes = encode(&envelope)?;

    println!("{}", envelope);
    println!("{}", hex::encode(&bytes));

    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}
