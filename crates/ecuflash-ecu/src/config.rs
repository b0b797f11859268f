//! Simulated ECU configuration
//!
//! Loaded from TOML or YAML. Every field has a default matching the
//! reference bootloader, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};

use ecuflash_proto::transport::MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Complete ECU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuConfig {
    /// ECU identifier used in logs
    #[serde(default = "default_id")]
    pub id: String,

    /// Software version reported under DID 0xF195
    #[serde(default = "default_software_version")]
    pub software_version: String,

    /// Session timing
    #[serde(default)]
    pub session: SessionConfig,

    /// Security access configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Transfer data configuration
    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_id() -> String {
    "bootloader".to_string()
}

fn default_software_version() -> String {
    "1234".to_string()
}

impl Default for EcuConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            software_version: default_software_version(),
            session: SessionConfig::default(),
            security: SecurityConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl EcuConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a YAML file
    pub fn load_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot be put on the wire
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.software_version.is_empty() || !self.software_version.is_ascii() {
            return Err(ConfigError::Invalid(format!(
                "software_version must be non-empty ASCII, got {:?}",
                self.software_version
            )));
        }
        if self.session.p2_ms > u64::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "session.p2_ms {} does not fit in 16 bits",
                self.session.p2_ms
            )));
        }
        if self.session.p2_star_ms / 10 > u64::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "session.p2_star_ms {} does not fit in 16 bits of 10 ms units",
                self.session.p2_star_ms
            )));
        }
        // SID + sequence counter + at least one data byte
        if self.transfer.max_block_length < 3 {
            return Err(ConfigError::Invalid(format!(
                "transfer.max_block_length {} is below the 3 byte minimum",
                self.transfer.max_block_length
            )));
        }
        if usize::from(self.transfer.max_block_length) > MAX_FRAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "transfer.max_block_length {} exceeds the {} byte frame limit",
                self.transfer.max_block_length, MAX_FRAME_LEN
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Session Configuration
// =============================================================================

/// Session timing, all values in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Non-default session falls back to default after this much silence
    #[serde(default = "default_session_timeout")]
    pub timeout_ms: u64,

    /// P2 server max, reported in the SessionControl response
    #[serde(default = "default_p2")]
    pub p2_ms: u64,

    /// P2* server max, reported in 10 ms units
    #[serde(default = "default_p2_star")]
    pub p2_star_ms: u64,
}

fn default_session_timeout() -> u64 {
    5_000
}

fn default_p2() -> u64 {
    50
}

fn default_p2_star() -> u64 {
    5_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_session_timeout(),
            p2_ms: default_p2(),
            p2_star_ms: default_p2_star(),
        }
    }
}

// =============================================================================
// Security Configuration
// =============================================================================

/// Security access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Lockout after an invalid key
    #[serde(default = "default_security_delay")]
    pub delay_ms: u64,

    /// Fixed RNG seed for reproducible seed values (entropy when unset)
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

fn default_security_delay() -> u64 {
    10_000
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_security_delay(),
            rng_seed: None,
        }
    }
}

// =============================================================================
// Transfer Configuration
// =============================================================================

/// What to do with an open download when a block arrives out of sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceErrorPolicy {
    /// Keep the sink and counter; the tester may resend the expected block
    #[default]
    Resume,
    /// Discard the sink; the tester must restart from block 1
    Abort,
}

/// Transfer data configuration for UDS 0x34/0x36/0x37
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Block counter value used after 0xFF (0 follows standard wrap-around)
    #[serde(default)]
    pub block_counter_wrap: u8,

    /// maxNumberOfBlockLength reported by RequestDownload (SID and counter included)
    #[serde(default = "default_max_block_length")]
    pub max_block_length: u16,

    #[serde(default)]
    pub on_sequence_error: SequenceErrorPolicy,

    /// Compare the checkMemory size/CRC against the bytes actually written
    #[serde(default = "default_verify_memory")]
    pub verify_memory: bool,

    /// Where the reconstructed image is written
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
}

fn default_max_block_length() -> u16 {
    0x0F02
}

fn default_verify_memory() -> bool {
    true
}

fn default_output_path() -> PathBuf {
    PathBuf::from("out.dat")
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_counter_wrap: 0,
            max_block_length: default_max_block_length(),
            on_sequence_error: SequenceErrorPolicy::default(),
            verify_memory: default_verify_memory(),
            output_path: default_output_path(),
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

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
