//! Client config loader using TOML and serde.
//!
//! Defaults point at the production deployment on Tea Sepolia, so a
//! missing config file still yields a working read-only client.
//!
//! ## Sources (later wins)
//!
//! 1. `Config::default()`
//! 2. TOML file named by `TEAPOLL_CONFIG` (or passed explicitly)
//! 3. Environment overrides: `TEAPOLL_RPC_URL`, `TEAPOLL_CONTRACT`,
//!    `TEAPOLL_LOOKBACK_BLOCKS`

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::types::{Address, ChainId};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Network parameters handed to the wallet when the chain must be added.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ChainParams {
    /// Numeric chain id.
    pub chain_id: ChainId,
    /// Human readable network name.
    pub chain_name: String,
    /// Native currency name.
    pub currency_name: String,
    /// Native currency symbol.
    pub currency_symbol: String,
    /// Native currency decimals.
    pub currency_decimals: u8,
    /// Public RPC endpoints.
    pub rpc_urls: Vec<String>,
    /// Block explorer base URLs.
    pub block_explorer_urls: Vec<String>,
}

impl ChainParams {
    /// Chain id in the `0x`-prefixed form wallets expect.
    pub fn chain_id_hex(&self) -> String {
        format!("0x{:X}", self.chain_id)
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            chain_id: 10218,
            chain_name: "Tea Sepolia".to_string(),
            currency_name: "Tea".to_string(),
            currency_symbol: "TEA".to_string(),
            currency_decimals: 18,
            rpc_urls: vec!["https://tea-sepolia.g.alchemy.com/public".to_string()],
            block_explorer_urls: vec!["https://sepolia.tea.xyz".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// JSON-RPC endpoint used for reads and log queries.
    pub rpc_url: String,

    /// Poll contract address.
    pub contract_address: String,

    /// Target network for the wallet.
    pub chain: ChainParams,

    /// How many blocks back the initial history query looks.
    pub history_lookback_blocks: u64,

    /// Interval between live log polls.
    pub event_poll_interval_ms: u64,

    /// Per-request RPC timeout.
    pub rpc_timeout_ms: u64,

    /// How many sequence keys the vote feed remembers for deduplication.
    pub dedup_memory: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rpc_url: "https://tea-sepolia.g.alchemy.com/public".to_string(),
            contract_address: "0x84eF19739811238D71321968AA96D1Aa3EcD4704".to_string(),
            chain: ChainParams::default(),
            history_lookback_blocks: 5000,
            event_poll_interval_ms: 4000,
            rpc_timeout_ms: 10_000,
            dedup_memory: 256,
        }
    }
}

impl Config {
    /// Contract address as a typed value.
    pub fn contract(&self) -> Address {
        Address::new(self.contract_address.clone())
    }

    /// Explorer link for the contract, if an explorer is configured.
    pub fn contract_explorer_url(&self) -> Option<String> {
        self.chain
            .block_explorer_urls
            .first()
            .map(|base| format!("{}/address/{}", base.trim_end_matches('/'), self.contract_address))
    }

    /// Check that all values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "rpc_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.contract().is_well_formed() {
            return Err(ConfigError::Invalid {
                field: "contract_address",
                reason: format!("'{}' is not a 20-byte hex address", self.contract_address),
            });
        }
        if self.event_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "event_poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.rpc_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "rpc_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.dedup_memory == 0 {
            return Err(ConfigError::Invalid {
                field: "dedup_memory",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Apply environment overrides on top of the current values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var("TEAPOLL_RPC_URL") {
            debug!("rpc_url overridden by TEAPOLL_RPC_URL");
            self.rpc_url = url;
        }
        if let Ok(addr) = std::env::var("TEAPOLL_CONTRACT") {
            debug!("contract_address overridden by TEAPOLL_CONTRACT");
            self.contract_address = addr;
        }
        if let Ok(val) = std::env::var("TEAPOLL_LOOKBACK_BLOCKS") {
            self.history_lookback_blocks = val.parse::<u64>().map_err(|_| ConfigError::Invalid {
                field: "TEAPOLL_LOOKBACK_BLOCKS",
                reason: format!("'{}' is not a number", val),
            })?;
        }
        Ok(())
    }

    /// Load defaults, the file named by `TEAPOLL_CONFIG` if set, then env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("TEAPOLL_CONFIG") {
            Ok(path) => {
                debug!("loading config from {}", path);
                load_from_file(path)?
            }
            Err(_) => Config::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Load config from a TOML file path.
/// Missing keys fall back to defaults; a missing file or parse failure is an error.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let s = fs::read_to_string(path.as_ref())?;
    let cfg: Config = toml::from_str(&s)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let def = Config::default();
        assert!(def.validate().is_ok());
        assert_eq!(def.chain.chain_id_hex(), "0x27EA");
        assert_eq!(def.history_lookback_blocks, 5000);
        assert_eq!(
            def.contract_explorer_url().unwrap(),
            "https://sepolia.tea.xyz/address/0x84eF19739811238D71321968AA96D1Aa3EcD4704"
        );
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        use std::io::Write;
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let toml = r#"
            rpc_url = "http://127.0.0.1:8545"
            history_lookback_blocks = 42

            [chain]
            chain_id = 31337
            chain_name = "Local"
        "#;
        let mut f = tmp.reopen().expect("reopen");
        write!(f, "{}", toml).expect("write");
        let cfg = load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.rpc_url, "http://127.0.0.1:8545");
        assert_eq!(cfg.history_lookback_blocks, 42);
        assert_eq!(cfg.chain.chain_id, 31337);
        assert_eq!(cfg.chain.currency_symbol, "TEA");
        assert_eq!(cfg.event_poll_interval_ms, 4000);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        use std::io::Write;
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let mut f = tmp.reopen().expect("reopen");
        write!(f, "rpc_url = [").expect("write");
        assert!(matches!(load_from_file(tmp.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = Config {
            contract_address: "0x1234".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "contract_address", .. })
        ));

        let cfg = Config {
            event_poll_interval_ms: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            rpc_url: "  ".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
