//! Monitor configuration
//!
//! Static settings are plain serde data so a board description can carry
//! them as TOML; runtime hooks (yield hook, compensation rules, crypto
//! delegate) are supplied to the monitor builder instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smc_platform::hal::SEC_RAM_SIZE_60KB;

use crate::error::{CommError, Result};
use crate::layout::PROTOCOL_MAJOR_VERSION;

/// Cache maintenance after RPC dispatch and around client messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheFlushMode {
    /// Flush the whole data cache
    #[default]
    Full,
    /// Flush only the L0/L1 pages and registered client buffers
    SharedRanges,
}

/// Static monitor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub cache_flush: CacheFlushMode,
    pub polling_thread_name: String,
    /// Longest single sleep of the polling engine
    pub max_sleep_ms: u64,
    /// Secure RAM size requested during SDP provisioning
    pub sec_ram_size: u32,
    /// Major protocol version the secure side must report
    pub protocol_major_version: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cache_flush: CacheFlushMode::Full,
            polling_thread_name: String::from("smodule"),
            max_sleep_ms: 0x3FFF_FFFF,
            sec_ram_size: SEC_RAM_SIZE_60KB,
            protocol_major_version: PROTOCOL_MAJOR_VERSION,
        }
    }
}

impl MonitorConfig {
    /// Parse a TOML document; missing keys take defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| CommError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling_thread_name.is_empty() {
            return Err(CommError::Config("polling_thread_name must not be empty".into()));
        }
        if self.max_sleep_ms == 0 {
            return Err(CommError::Config("max_sleep_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn max_sleep(&self) -> Duration {
        Duration::from_millis(self.max_sleep_ms)
    }
}

/// Backing-store addresses handed to the SDP runtime and the secure side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SdpAddresses {
    pub backing_store: u32,
    pub back_ext_storage: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.cache_flush, CacheFlushMode::Full);
        assert_eq!(config.sec_ram_size, 0xF000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = MonitorConfig::from_toml_str(
            r#"
            cache_flush = "shared-ranges"
            max_sleep_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.cache_flush, CacheFlushMode::SharedRanges);
        assert_eq!(config.max_sleep(), Duration::from_millis(500));
        assert_eq!(config.polling_thread_name, "smodule");
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys() {
        assert!(matches!(
            MonitorConfig::from_toml_str("queue_depth = 64"),
            Err(CommError::Config(_))
        ));
    }

    #[test]
    fn test_validation() {
        let config = MonitorConfig {
            max_sleep_ms: 0,
            ..MonitorConfig::default()
        };
        assert!(matches!(config.validate(), Err(CommError::Config(_))));
    }
}
