//! Combined configuration file for the `ecuflash` binary

use std::path::Path;

use anyhow::{Context, Result};
use ecuflash_client::FlashConfig;
use ecuflash_ecu::EcuConfig;
use serde::{Deserialize, Serialize};

/// `[ecu]` and `[client]` tables of one TOML file; both optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub ecu: EcuConfig,

    #[serde(default)]
    pub client: FlashConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.ecu.validate()?;
        config.client.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.ecu.software_version, "1234");
        assert_eq!(config.client.start_address, 0x001D_0000);
    }

    #[test]
    fn test_both_tables() {
        let config = AppConfig::from_toml(
            r#"
[ecu]
software_version = "2.0.1"

[ecu.transfer]
max_block_length = 514
verify_memory = false

[client]
start_address = "0x00080000"
block_size = 4096

[client.timeouts]
settle_ms = 100
"#,
        )
        .unwrap();
        assert_eq!(config.ecu.software_version, "2.0.1");
        assert_eq!(config.ecu.transfer.max_block_length, 514);
        assert!(!config.ecu.transfer.verify_memory);
        assert_eq!(config.client.start_address, 0x0008_0000);
        assert_eq!(config.client.block_size, 4096);
        assert_eq!(config.client.timeouts.settle_ms, 100);
        assert_eq!(config.client.timeouts.response_ms, 1_000);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let config = AppConfig::from_toml(include_str!("../../../config/ecuflash.toml")).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(config.ecu.session.timeout_ms, defaults.ecu.session.timeout_ms);
        assert_eq!(
            config.ecu.transfer.max_block_length,
            defaults.ecu.transfer.max_block_length
        );
        assert_eq!(config.client.start_address, defaults.client.start_address);
        assert_eq!(
            config.client.timeouts.settle_ms,
            defaults.client.timeouts.settle_ms
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_toml("[client]\nblock_size = 0\n").is_err());
        assert!(AppConfig::from_toml("[ecu]\nsoftware_version = \"\"\n").is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecuflash.toml");
        std::fs::write(&path, "[ecu]\nid = \"bench\"\n").unwrap();
        assert_eq!(AppConfig::load(&path).unwrap().ecu.id, "bench");
        assert!(AppConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
