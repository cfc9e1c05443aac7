//! Protocol settings and network limits for the Basalt blockchain.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Blockchain timing constants.
pub const SECONDS_PER_BLOCK: u64 = 15;
pub const MILLISECONDS_PER_BLOCK: u64 = SECONDS_PER_BLOCK * 1000;

/// Network limits.
pub const MAX_BLOCK_SIZE: usize = 1_048_576; // 1MB
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 512;

/// Per-block cap on cumulative transaction system fees.
pub const MAX_BLOCK_SYSTEM_FEE: i64 = 900_000_000_000;

/// Size of a hash (UInt256) in bytes.
pub const HASH_SIZE: usize = 32;
/// Size of an address (UInt160) in bytes.
pub const ADDRESS_SIZE: usize = 20;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Network type for the Basalt blockchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NetworkType {
    MainNet,
    #[default]
    TestNet,
    Private,
}

impl NetworkType {
    /// Gets the network magic number, mixed into every signature.
    pub fn magic(&self) -> u32 {
        match self {
            NetworkType::MainNet => 0x4c_41_53_42, // "BSAL" little endian
            NetworkType::TestNet => 0x54_4c_53_42, // "BSLT"
            NetworkType::Private => 0x00000000,
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::MainNet => write!(f, "mainnet"),
            NetworkType::TestNet => write!(f, "testnet"),
            NetworkType::Private => write!(f, "private"),
        }
    }
}

impl FromStr for NetworkType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(NetworkType::MainNet),
            "testnet" | "test" => Ok(NetworkType::TestNet),
            "private" | "privnet" => Ok(NetworkType::Private),
            other => Err(ConfigError::Invalid(format!("unknown network: {other}"))),
        }
    }
}

/// Protocol settings, fixed for the lifetime of a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Network magic number, included in all sign-data.
    pub network: u32,
    /// Target block interval in milliseconds.
    pub milliseconds_per_block: u64,
    /// Maximum number of transactions in one block.
    pub max_transactions_per_block: usize,
    /// Maximum serialized block size in bytes.
    pub max_block_size: usize,
    /// Maximum cumulative system fee in one block.
    pub max_block_system_fee: i64,
    /// Hex-encoded compressed public keys of the validator set, in order.
    pub validators: Vec<String>,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            network: NetworkType::TestNet.magic(),
            milliseconds_per_block: MILLISECONDS_PER_BLOCK,
            max_transactions_per_block: MAX_TRANSACTIONS_PER_BLOCK,
            max_block_size: MAX_BLOCK_SIZE,
            max_block_system_fee: MAX_BLOCK_SYSTEM_FEE,
            validators: Vec::new(),
        }
    }
}

impl ProtocolSettings {
    /// Parses settings from a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.validators.is_empty() && self.validators.len() < 4 {
            return Err(ConfigError::Invalid(
                "validator set must have at least 4 members".to_string(),
            ));
        }
        if self.milliseconds_per_block == 0 {
            return Err(ConfigError::Invalid(
                "milliseconds_per_block must be positive".to_string(),
            ));
        }
        if self.max_transactions_per_block == 0 {
            return Err(ConfigError::Invalid(
                "max_transactions_per_block must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_magic() {
        assert_ne!(NetworkType::MainNet.magic(), NetworkType::TestNet.magic());
        assert_eq!("mainnet".parse::<NetworkType>().unwrap(), NetworkType::MainNet);
        assert!("nonsense".parse::<NetworkType>().is_err());
    }

    #[test]
    fn test_default_settings_validate() {
        let settings = ProtocolSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.milliseconds_per_block, 15_000);
        assert_eq!(settings.max_transactions_per_block, 512);
    }

    #[test]
    fn test_from_toml() {
        let settings = ProtocolSettings::from_toml(
            r#"
            network = 5
            milliseconds_per_block = 1000
            validators = ["aa", "bb", "cc", "dd"]
            "#,
        )
        .unwrap();
        assert_eq!(settings.network, 5);
        assert_eq!(settings.milliseconds_per_block, 1000);
        assert_eq!(settings.validators.len(), 4);
        assert_eq!(settings.max_block_size, MAX_BLOCK_SIZE);
    }

    #[test]
    fn test_small_validator_set_rejected() {
        let result = ProtocolSettings::from_toml(r#"validators = ["aa", "bb", "cc"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_block_time_rejected() {
        let result = ProtocolSettings::from_toml("milliseconds_per_block = 0");
        assert!(result.is_err());
    }
}
