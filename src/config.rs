use dbft_crypto::KeyPair;
use dbft_types::{ConsensusError, ConsensusSettings, PublicKey, ValidatorIndex, ValidatorSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub consensus: ConsensusConfig,
    pub genesis: GenesisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub index: u16,
    pub listen_addr: String,
    /// Hex-encoded 32 byte ed25519 secret. Falls back to the validator seed
    /// at `index` when unset.
    #[serde(default)]
    pub private_key_hex: Option<String>,
    /// Follow consensus without signing anything.
    #[serde(default)]
    pub watch_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Peers as `index=host:port`.
    pub peers: Vec<String>,
    pub reconnect_interval_secs: u64,
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub block_time_ms: u64,
    pub max_transactions_per_block: usize,
    pub max_future_drift_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub timestamp_ms: u64,
    /// Hex-encoded validator public keys in index order.
    #[serde(default)]
    pub validator_keys: Vec<String>,
    /// Development seeds, used when `validator_keys` is empty.
    #[serde(default)]
    pub validator_seeds: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                index: 0,
                listen_addr: "0.0.0.0:20333".to_string(),
                private_key_hex: None,
                watch_only: false,
            },
            network: NetworkConfig {
                peers: vec![],
                reconnect_interval_secs: 5,
                tick_interval_ms: 1_000,
            },
            consensus: ConsensusConfig {
                block_time_ms: 15_000,
                max_transactions_per_block: 500,
                max_future_drift_ms: 10 * 60 * 1000,
            },
            genesis: GenesisConfig {
                timestamp_ms: 1_700_000_000_000,
                validator_keys: vec![],
                validator_seeds: (0..4).map(|i| format!("validator-{}", i)).collect(),
            },
        }
    }
}

impl AppConfig {
    /// Defaults, then `path` if it exists, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConsensusError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let mut app_config = if path.exists() {
            Self::from_file(path)?
        } else {
            AppConfig::default()
        };

        app_config.override_from(|key| std::env::var(key).ok())?;
        app_config.validate()?;

        Ok(app_config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConsensusError> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .map_err(|e| ConsensusError::ConfigError(format!("Failed to build defaults: {}", e)))?;

        config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path))
            .build()
            .and_then(|settings| settings.try_deserialize::<AppConfig>())
            .map_err(|e| ConsensusError::ConfigError(format!("Failed to load {}: {}", path.display(), e)))
    }

    /// Applies overrides from `lookup`, normally the process environment.
    pub fn override_from<F>(&mut self, lookup: F) -> Result<(), ConsensusError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(index) = lookup("NODE_INDEX") {
            self.node.index = parse_env("NODE_INDEX", &index)?;
        }

        if let Some(listen_addr) = lookup("LISTEN_ADDR") {
            self.node.listen_addr = listen_addr;
        }

        if let Some(key) = lookup("PRIVATE_KEY_HEX") {
            self.node.private_key_hex = Some(key);
        }

        if let Some(peers) = lookup("PEERS") {
            self.network.peers = split_list(&peers);
        }

        if let Some(block_time) = lookup("BLOCK_TIME_MS") {
            self.consensus.block_time_ms = parse_env("BLOCK_TIME_MS", &block_time)?;
        }

        if let Some(max_tx) = lookup("MAX_TRANSACTIONS_PER_BLOCK") {
            self.consensus.max_transactions_per_block = parse_env("MAX_TRANSACTIONS_PER_BLOCK", &max_tx)?;
        }

        if let Some(seeds) = lookup("VALIDATOR_SEEDS") {
            self.genesis.validator_seeds = split_list(&seeds);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        self.consensus_settings()?;
        let validators = self.validator_set()?;

        if !self.node.watch_only && !validators.contains_index(self.node_index()) {
            return Err(ConsensusError::ConfigError(format!(
                "node index {} is outside the {} validators",
                self.node.index,
                validators.len()
            )));
        }

        if self.network.tick_interval_ms == 0 {
            return Err(ConsensusError::ConfigError(
                "tick_interval_ms must be greater than 0".to_string(),
            ));
        }

        self.listen_addr()?;
        self.peers()?;

        Ok(())
    }

    pub fn node_index(&self) -> ValidatorIndex {
        ValidatorIndex(self.node.index)
    }

    pub fn consensus_settings(&self) -> Result<ConsensusSettings, ConsensusError> {
        let settings = ConsensusSettings {
            max_future_drift_ms: self.consensus.max_future_drift_ms,
            ..ConsensusSettings::new(
                self.consensus.block_time_ms,
                self.consensus.max_transactions_per_block,
            )?
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validator_set(&self) -> Result<ValidatorSet, ConsensusError> {
        let keys = if self.genesis.validator_keys.is_empty() {
            self.genesis
                .validator_seeds
                .iter()
                .map(|seed| KeyPair::from_seed(seed).public_key())
                .collect()
        } else {
            self.genesis
                .validator_keys
                .iter()
                .map(|key| {
                    let bytes = hex::decode(key).map_err(|e| {
                        ConsensusError::ConfigError(format!("Invalid validator key {}: {}", key, e))
                    })?;
                    PublicKey::from_slice(&bytes)
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        ValidatorSet::new(keys)
    }

    /// Signing key for this node. `None` for watch-only nodes.
    pub fn key_pair(&self) -> Result<Option<KeyPair>, ConsensusError> {
        if self.node.watch_only {
            return Ok(None);
        }

        if let Some(key_hex) = &self.node.private_key_hex {
            let bytes = hex::decode(key_hex)
                .map_err(|e| ConsensusError::ConfigError(format!("Invalid PRIVATE_KEY_HEX: {}", e)))?;
            return KeyPair::from_bytes(&bytes).map(Some);
        }

        self.genesis
            .validator_seeds
            .get(usize::from(self.node.index))
            .map(|seed| Some(KeyPair::from_seed(seed)))
            .ok_or_else(|| {
                ConsensusError::ConfigError(format!("No private key or seed for node {}", self.node.index))
            })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConsensusError> {
        self.node
            .listen_addr
            .parse()
            .map_err(|e| ConsensusError::ConfigError(format!("Invalid listen_addr: {}", e)))
    }

    pub fn peers(&self) -> Result<HashMap<ValidatorIndex, SocketAddr>, ConsensusError> {
        self.network
            .peers
            .iter()
            .map(|entry| {
                let (index, addr) = entry.split_once('=').ok_or_else(|| {
                    ConsensusError::ConfigError(format!("Peer {} is not in index=addr form", entry))
                })?;
                let index: u16 = parse_env("peer index", index.trim())?;
                let addr: SocketAddr = parse_env("peer address", addr.trim())?;
                Ok((ValidatorIndex(index), addr))
            })
            .collect()
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConsensusError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConsensusError::ConfigError(format!("Invalid {} {:?}: {}", name, value, e)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.validator_set().unwrap().len(), 4);
        assert!(config.key_pair().unwrap().is_some());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .override_from(env(&[
                ("NODE_INDEX", "2"),
                ("LISTEN_ADDR", "127.0.0.1:30000"),
                ("PEERS", "0=127.0.0.1:30001, 1=127.0.0.1:30002,"),
                ("BLOCK_TIME_MS", "2000"),
                ("MAX_TRANSACTIONS_PER_BLOCK", "10"),
                ("VALIDATOR_SEEDS", "a,b,c,d,e,f,g"),
            ]))
            .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.node_index(), ValidatorIndex(2));
        assert_eq!(config.consensus_settings().unwrap().block_time_ms, 2000);
        assert_eq!(config.validator_set().unwrap().len(), 7);

        let peers = config.peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[&ValidatorIndex(1)], "127.0.0.1:30002".parse().unwrap());

        let key = config.key_pair().unwrap().unwrap();
        assert_eq!(key.public_key(), KeyPair::from_seed("c").public_key());
    }

    #[test]
    fn test_invalid_env_value_rejected() {
        let mut config = AppConfig::default();
        let result = config.override_from(env(&[("BLOCK_TIME_MS", "soon")]));
        assert!(matches!(result, Err(ConsensusError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.node.index = 9;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.network.peers = vec!["127.0.0.1:1".to_string()];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.consensus.block_time_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.genesis.validator_seeds.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_private_key_hex_and_watch_only() {
        let secret = KeyPair::from_seed("operator").private_key();

        let mut config = AppConfig::default();
        config.node.private_key_hex = Some(hex::encode(&secret));
        let key = config.key_pair().unwrap().unwrap();
        assert_eq!(key.public_key(), KeyPair::from_seed("operator").public_key());

        config.node.private_key_hex = Some("zz".to_string());
        assert!(config.key_pair().is_err());

        config.node.watch_only = true;
        config.node.index = 40;
        assert!(config.key_pair().unwrap().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_validator_keys() {
        let mut config = AppConfig::default();
        config.genesis.validator_keys = (0..4)
            .map(|i| hex::encode(KeyPair::from_seed(&format!("k{}", i)).public_key().as_bytes()))
            .collect();
        let set = config.validator_set().unwrap();
        assert_eq!(set.get(ValidatorIndex(3)), Some(&KeyPair::from_seed("k3").public_key()));

        config.genesis.validator_keys[0] = "abcd".to_string();
        assert!(config.validator_set().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[node]
index = 1
listen_addr = "127.0.0.1:21000"

[network]
peers = ["0=127.0.0.1:21001"]
reconnect_interval_secs = 1
tick_interval_ms = 250

[consensus]
block_time_ms = 3000
max_transactions_per_block = 50
max_future_drift_ms = 60000

[genesis]
timestamp_ms = 1000
validator_seeds = ["s0", "s1", "s2", "s3"]
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.index, 1);
        assert_eq!(config.network.tick_interval_ms, 250);
        assert_eq!(config.consensus.block_time_ms, 3000);
        assert_eq!(config.consensus_settings().unwrap().max_future_drift_ms, 60_000);
        assert_eq!(config.genesis.validator_seeds[1], "s1");
        assert!(!config.node.watch_only);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[consensus]\nblock_time_ms = 5000").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.consensus.block_time_ms, 5000);
        assert_eq!(config.consensus.max_transactions_per_block, 500);
        assert_eq!(config.network.tick_interval_ms, 1000);
    }
}
