// Node configuration.
//
// An immutable value loaded once at startup and threaded through every
// constructor. The on-disk form is camelCase JSON; every section falls back
// to defaults, so a partial (or absent) file still yields a runnable node.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consensus::difficulty::DifficultyAlgorithm;

pub const DEFAULT_P2P_PORT: u16 = 22000;
pub const DEFAULT_API_PORT: u16 = 22001;
pub const DEFAULT_BLOCK_TIME_MS: u64 = 60_000;
pub const DEFAULT_DECIMALS: u32 = 8;
/// Data directory name under the user's home.
pub const DATA_DIR: &str = ".pastella";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("api.apiKey is mandatory when api.host is not loopback")]
    ApiKeyRequired,
    #[error("invalid config value: {0}")]
    InvalidValue(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenesisConfig {
    /// Milliseconds since epoch.
    pub timestamp: u64,
    pub premine_address: String,
    pub premine_amount: u64,
    pub difficulty: u64,
    /// When nonce and hash are both present the genesis is trusted verbatim;
    /// otherwise it is mined at bootstrap.
    pub nonce: Option<u64>,
    pub hash: Option<String>,
    pub algorithm: String,
    pub coinbase_nonce: String,
    pub coinbase_atomic_sequence: u64,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        GenesisConfig {
            timestamp: 1_700_000_000_000,
            premine_address: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".to_string(),
            premine_amount: 10_000_000_000,
            difficulty: 1000,
            nonce: None,
            hash: None,
            algorithm: "velora".to_string(),
            coinbase_nonce: "pastella-genesis".to_string(),
            coinbase_atomic_sequence: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockchainConfig {
    /// Target block spacing in milliseconds.
    pub block_time: u64,
    pub coinbase_reward: u64,
    pub difficulty_algorithm: DifficultyAlgorithm,
    pub halving_interval: u64,
    pub mempool_max_size_kb: usize,
    pub genesis: GenesisConfig,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        BlockchainConfig {
            block_time: DEFAULT_BLOCK_TIME_MS,
            coinbase_reward: 50_0000_0000,
            difficulty_algorithm: DifficultyAlgorithm::default(),
            halving_interval: 210_000,
            mempool_max_size_kb: 1024,
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub p2p_port: u16,
    /// Seed URLs, `ws://host:port`.
    pub seed_nodes: Vec<String>,
    pub min_seed_connections: usize,
    pub max_peers: usize,
    pub network_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            p2p_port: DEFAULT_P2P_PORT,
            seed_nodes: Vec::new(),
            min_seed_connections: 2,
            max_peers: 10,
            network_id: "pastella-mainnet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletConfig {
    pub default_fee: u64,
    pub min_fee: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig {
            default_fee: 10_000,
            min_fee: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub blockchain_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: default_data_dir().to_string_lossy().into_owned(),
            blockchain_file: "blockchain.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub port: u16,
    pub host: String,
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            port: DEFAULT_API_PORT,
            host: "127.0.0.1".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub blockchain: BlockchainConfig,
    pub network: NetworkConfig,
    pub wallet: WalletConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub decimals: Option<u32>,
}

impl Config {
    /// Read a config file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let host_is_loopback = matches!(self.api.host.as_str(), "127.0.0.1" | "localhost" | "::1");
        if !host_is_loopback && self.api.api_key.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::ApiKeyRequired);
        }
        if self.network.min_seed_connections > 10 {
            return Err(ConfigError::InvalidValue("minSeedConnections must be 0-10"));
        }
        if self.blockchain.block_time == 0 {
            return Err(ConfigError::InvalidValue("blockTime must be positive"));
        }
        if self.network.network_id.is_empty() {
            return Err(ConfigError::InvalidValue("networkId must not be empty"));
        }
        Ok(())
    }

    pub fn decimals(&self) -> u32 {
        self.decimals.unwrap_or(DEFAULT_DECIMALS)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    pub fn blockchain_file(&self) -> PathBuf {
        self.data_dir().join(&self.storage.blockchain_file)
    }

    pub fn reputation_file(&self) -> PathBuf {
        self.data_dir().join("peer-reputation.json")
    }

    pub fn identity_file(&self) -> PathBuf {
        self.data_dir().join("identity.json")
    }

    pub fn wallet_file(&self) -> PathBuf {
        self.data_dir().join("wallet.json")
    }
}

pub fn default_data_dir() -> PathBuf {
    PathBuf::from(resolve_home_dir()).join(DATA_DIR)
}

fn resolve_home_dir() -> String {
    if let Ok(home) = std::env::var("HOME")
        && !home.trim().is_empty()
    {
        return home;
    }
    #[cfg(windows)]
    {
        if let Ok(home) = std::env::var("USERPROFILE") {
            if !home.trim().is_empty() {
                return home;
            }
        }
    }
    ".".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.blockchain.block_time, 60_000);
        assert_eq!(config.network.max_peers, 10);
        assert_eq!(config.decimals(), 8);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: Config = serde_json::from_str(
            r#"{"network": {"p2pPort": 9999, "networkId": "testnet"}}"#,
        )
        .unwrap();
        assert_eq!(parsed.network.p2p_port, 9999);
        assert_eq!(parsed.network.network_id, "testnet");
        assert_eq!(parsed.blockchain.block_time, DEFAULT_BLOCK_TIME_MS);
    }

    #[test]
    fn test_non_loopback_requires_api_key() {
        let mut config = Config::default();
        config.api.host = "0.0.0.0".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::ApiKeyRequired)));

        config.api.api_key = Some("secret".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_seed_connection_bound() {
        let mut config = Config::default();
        config.network.min_seed_connections = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/pastella.json")).unwrap();
        assert_eq!(config.network.network_id, "pastella-mainnet");
    }

    #[test]
    fn test_genesis_camel_case_keys() {
        let json = serde_json::to_value(GenesisConfig::default()).unwrap();
        assert!(json.get("premineAddress").is_some());
        assert!(json.get("coinbaseAtomicSequence").is_some());
    }
}
