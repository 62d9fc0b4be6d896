//! Client configuration, loaded from YAML with environment overrides.

use crate::error::{MarketError, Result};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Chains accepted when the configuration does not list its own
pub const DEFAULT_SUPPORTED_CHAINS: &[u64] = &[84532, 5611, 8453, 31337];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractAddresses {
    pub job_marketplace: Address,
    pub node_registry: Address,
    pub model_registry: Address,
    /// Stable-denominated payment token (e.g. USDC)
    pub stable_token: Address,
    pub treasury: Address,
}

impl Default for ContractAddresses {
    fn default() -> Self {
        Self {
            job_marketplace: Address::zero(),
            node_registry: Address::zero(),
            model_registry: Address::zero(),
            stable_token: Address::zero(),
            treasury: Address::zero(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    /// Blocks to wait before a transaction is treated as durable
    pub confirmations: usize,
    pub contracts: ContractAddresses,
    /// Chain identifiers sessions may be opened on
    pub supported_chains: Vec<u64>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 84532,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            confirmations: 3,
            contracts: ContractAddresses::default(),
            supported_chains: DEFAULT_SUPPORTED_CHAINS.to_vec(),
        }
    }
}

impl ChainConfig {
    pub fn validate_chain(&self, chain_id: u64) -> Result<()> {
        if self.supported_chains.contains(&chain_id) {
            Ok(())
        } else {
            Err(MarketError::UnsupportedChain(chain_id))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    /// Fixed-point price (PRICE_PRECISION = 1000)
    pub price_per_token: u64,
    pub duration_secs: u64,
    pub proof_interval: u64,
    pub encryption: bool,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            price_per_token: 5000,
            duration_secs: 3600,
            proof_interval: 1000,
            encryption: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub min_tokens: u64,
    /// Minimum time the proof system requires between two checkpoints
    pub cooldown_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            min_tokens: 100,
            cooldown_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    /// How long to wait for a usage notice after the final content marker
    pub safety_timeout_ms: u64,
    /// Upper bound on a whole prompt exchange
    pub response_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            reconnect_backoff_ms: 1000,
            safety_timeout_ms: 3000,
            response_timeout_ms: 120_000,
        }
    }
}

impl TransportConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn safety_timeout(&self) -> Duration {
        Duration::from_millis(self.safety_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub cache_ttl_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 300 }
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub chain: ChainConfig,
    pub session: SessionDefaults,
    pub checkpoint: CheckpointConfig,
    pub transport: TransportConfig,
    pub discovery: DiscoveryConfig,
    /// Signer key; normally supplied through `MARKET_PRIVATE_KEY`
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
}

impl MarketConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            MarketError::Configuration(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| MarketError::Configuration(format!("invalid YAML: {}", e)))
    }

    /// Apply `MARKET_RPC_URL`, `MARKET_CHAIN_ID` and `MARKET_PRIVATE_KEY`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("MARKET_RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Ok(chain_id) = std::env::var("MARKET_CHAIN_ID") {
            self.chain.chain_id = chain_id.parse().map_err(|_| {
                MarketError::Configuration(format!("MARKET_CHAIN_ID is not a number: {}", chain_id))
            })?;
        }
        if let Ok(key) = std::env::var("MARKET_PRIVATE_KEY") {
            self.private_key = Some(key);
        }
        Ok(())
    }

    /// Reject configurations that would only fail later at call time
    pub fn validate(&self) -> Result<()> {
        if self.chain.chain_id == 0 {
            return Err(MarketError::Configuration("chain_id must be set".into()));
        }
        self.chain.validate_chain(self.chain.chain_id)?;

        let contracts = &self.chain.contracts;
        for (name, address) in [
            ("job_marketplace", contracts.job_marketplace),
            ("node_registry", contracts.node_registry),
            ("model_registry", contracts.model_registry),
        ] {
            if address.is_zero() {
                return Err(MarketError::Configuration(format!(
                    "missing contract address: {}",
                    name
                )));
            }
        }

        if self.chain.confirmations == 0 {
            return Err(MarketError::Configuration(
                "confirmations must be at least 1".into(),
            ));
        }
        if self.transport.safety_timeout_ms == 0 {
            return Err(MarketError::Configuration(
                "safety_timeout_ms must be positive".into(),
            ));
        }
        if self.transport.response_timeout_ms < self.transport.safety_timeout_ms {
            return Err(MarketError::Configuration(
                "response_timeout_ms must not be shorter than safety_timeout_ms".into(),
            ));
        }
        if self.checkpoint.min_tokens == 0 {
            return Err(MarketError::Configuration(
                "checkpoint.min_tokens must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn default_price(&self) -> U256 {
        U256::from(self.session.price_per_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MarketConfig::default();
        assert_eq!(config.session.price_per_token, 5000);
        assert_eq!(config.checkpoint.min_tokens, 100);
        assert_eq!(config.transport.reconnect_attempts, 3);
        assert_eq!(config.discovery.cache_ttl_secs, 300);
    }

    #[test]
    fn test_zero_contract_address_rejected() {
        let err = MarketConfig::default().validate().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_yaml_round_trip_with_partial_document() {
        let yaml = r#"
chain:
  chain_id: 5611
  rpc_url: "http://localhost:9545"
  confirmations: 1
  contracts:
    job_marketplace: "0x1000000000000000000000000000000000000001"
    node_registry: "0x1000000000000000000000000000000000000002"
    model_registry: "0x1000000000000000000000000000000000000003"
    stable_token: "0x1000000000000000000000000000000000000004"
    treasury: "0x1000000000000000000000000000000000000005"
transport:
  reconnect_attempts: 5
  reconnect_backoff_ms: 200
  safety_timeout_ms: 1500
"#;
        let config = MarketConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.chain.chain_id, 5611);
        assert_eq!(config.transport.reconnect_attempts, 5);
        // Sections left out keep their defaults
        assert_eq!(config.session.proof_interval, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unsupported_chain() {
        let chain = ChainConfig::default();
        assert!(chain.validate_chain(31337).is_ok());
        let err = chain.validate_chain(999).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_CHAIN");
    }

    #[test]
    fn test_supported_chains_from_yaml() {
        let config = MarketConfig::from_yaml(
            r#"
chain:
  chain_id: 1337
  supported_chains: [1337]
"#,
        )
        .unwrap();
        assert!(config.chain.validate_chain(1337).is_ok());
        assert!(config.chain.validate_chain(84532).is_err());
    }
}
