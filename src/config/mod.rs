pub mod accessory_config;

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::{LevelFilter, info};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub use crate::config::accessory_config::{AccessoryConfig, AccessoryKind};
use crate::core::bluetooth::SessionConfig;

fn default_log_level() -> String {
    "info".to_string()
}

/// Bridge configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Delay before a failed connect is retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,

    /// Pause between a disconnect and the reconnect attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_settle_ms: Option<u64>,

    /// Upper bound for finding and connecting a peripheral
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    #[serde(default)]
    pub accessories: Vec<AccessoryConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            retry_delay_ms: None,
            reconnect_settle_ms: None,
            connect_timeout_ms: None,
            accessories: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Loads and validates the config from a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_json = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&config_json)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        info!(
            "Config loaded from {:?} ({} accessories)",
            path,
            config.accessories.len()
        );
        Ok(config)
    }

    pub fn from_json(config_json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(config_json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.level_filter()?;

        let timings = [
            ("retry_delay_ms", self.retry_delay_ms),
            ("reconnect_settle_ms", self.reconnect_settle_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        for (field, value) in timings {
            if value == Some(0) {
                bail!("{} must be greater than zero", field);
            }
        }

        // Console lookups ignore case, so names must differ beyond case.
        let mut names = HashSet::new();
        for accessory in &self.accessories {
            accessory.validate()?;
            if !names.insert(accessory.name.to_lowercase()) {
                bail!("accessory name {:?} is used more than once", accessory.name);
            }
        }
        Ok(())
    }

    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| anyhow!("unknown log_level {:?}", self.log_level))
    }

    /// Session timings with unset values taken from the defaults
    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            retry_delay: self
                .retry_delay_ms
                .map_or(defaults.retry_delay, Duration::from_millis),
            settle_delay: self
                .reconnect_settle_ms
                .map_or(defaults.settle_delay, Duration::from_millis),
            connect_timeout: self
                .connect_timeout_ms
                .map_or(defaults.connect_timeout, Duration::from_millis),
            ..defaults
        }
    }
}
