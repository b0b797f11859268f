//! Flash client configuration with TOML/YAML support

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flash client configuration
///
/// Can be loaded from YAML, TOML, or constructed with [`FlashConfig::builder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Target address for erase, download and memory check
    #[serde(
        default = "default_start_address",
        deserialize_with = "deserialize_hex_u32"
    )]
    pub start_address: u32,

    /// Preferred TransferData payload size; clamped to what the ECU accepts
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Block counter value used after 0xFF (0 follows standard wrap-around)
    #[serde(default)]
    pub block_counter_wrap: u8,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

fn default_start_address() -> u32 {
    0x001D_0000
}

fn default_block_size() -> usize {
    1024
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            start_address: default_start_address(),
            block_size: default_block_size(),
            block_counter_wrap: 0,
            timeouts: TimeoutsConfig::default(),
        }
    }
}

/// Timeout configuration, all values in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// How long a request may go unanswered before the job aborts
    #[serde(default = "default_response_timeout")]
    pub response_ms: u64,

    /// Pause after entering the programming session
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
}

fn default_response_timeout() -> u64 {
    1_000
}

fn default_settle() -> u64 {
    1_500
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            response_ms: default_response_timeout(),
            settle_ms: default_settle(),
        }
    }
}

impl FlashConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to YAML
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block_size must be at least 1".into()));
        }
        if self.timeouts.response_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeouts.response_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Create a builder for programmatic configuration
    pub fn builder() -> FlashConfigBuilder {
        FlashConfigBuilder::default()
    }
}

/// Builder for [`FlashConfig`]
#[derive(Debug, Default)]
pub struct FlashConfigBuilder {
    config: FlashConfig,
}

impl FlashConfigBuilder {
    pub fn start_address(mut self, address: u32) -> Self {
        self.config.start_address = address;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    pub fn block_counter_wrap(mut self, wrap: u8) -> Self {
        self.config.block_counter_wrap = wrap;
        self
    }

    pub fn response_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.response_ms = ms;
        self
    }

    pub fn settle_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.settle_ms = ms;
        self
    }

    pub fn build(self) -> Result<FlashConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Deserialize a hex u32 (supports "0x1D0000" or 1900544)
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Hex(String),
        Int(u32),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Hex(s) => {
            let s = s.trim();
            let digits = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .unwrap_or(s);
            u32::from_str_radix(digits, 16).map_err(|e| D::Error::custom(e.to_string()))
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
