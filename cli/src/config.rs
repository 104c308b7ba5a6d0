// Configuration management for the blegate CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blegate/config.json
// - Linux: ~/.config/blegate/config.json
// - Windows: %APPDATA%\blegate\config.json

use anyhow::{Context, Result};
use blegate_core::AdapterConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dongle settings passed to the adapter
    pub adapter: AdapterConfig,

    /// Default duration of `blegate scan`
    pub scan_seconds: u64,

    /// How long to wait for a link, discovery or GATT completion
    pub operation_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            scan_seconds: 10,
            operation_timeout_secs: 15,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blegate");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, or write and return the defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The caller persists the result.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "port" => {
                self.adapter.port = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "baud_rate" => {
                self.adapter.baud_rate = value.parse().context("Invalid baud rate")?;
            }
            "transaction_timeout_ms" => {
                self.adapter.transaction_timeout_ms = value.parse().context("Invalid number")?;
            }
            "connect_retries" => {
                self.adapter.connect_retries = value.parse().context("Invalid number")?;
            }
            "connect_retry_delay_ms" => {
                self.adapter.connect_retry_delay_ms = value.parse().context("Invalid number")?;
            }
            "connect_reservation_ms" => {
                self.adapter.connect_reservation_ms = value.parse().context("Invalid number")?;
            }
            "scan_seconds" => {
                self.scan_seconds = value.parse().context("Invalid number")?;
            }
            "operation_timeout_secs" => {
                self.operation_timeout_secs = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.adapter
            .validate()
            .with_context(|| format!("Rejected value for {}", key))?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "port" => self.adapter.port.clone(),
            "baud_rate" => Some(self.adapter.baud_rate.to_string()),
            "transaction_timeout_ms" => Some(self.adapter.transaction_timeout_ms.to_string()),
            "connect_retries" => Some(self.adapter.connect_retries.to_string()),
            "connect_retry_delay_ms" => Some(self.adapter.connect_retry_delay_ms.to_string()),
            "connect_reservation_ms" => Some(self.adapter.connect_reservation_ms.to_string()),
            "scan_seconds" => Some(self.scan_seconds.to_string()),
            "operation_timeout_secs" => Some(self.operation_timeout_secs.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "port".to_string(),
                self.adapter
                    .port
                    .clone()
                    .unwrap_or_else(|| "(not set)".to_string()),
            ),
            ("baud_rate".to_string(), self.adapter.baud_rate.to_string()),
            (
                "transaction_timeout_ms".to_string(),
                self.adapter.transaction_timeout_ms.to_string(),
            ),
            ("connect_retries".to_string(), self.adapter.connect_retries.to_string()),
            (
                "connect_retry_delay_ms".to_string(),
                self.adapter.connect_retry_delay_ms.to_string(),
            ),
            (
                "connect_reservation_ms".to_string(),
                self.adapter.connect_reservation_ms.to_string(),
            ),
            ("scan_seconds".to_string(), format!("{}s", self.scan_seconds)),
            (
                "operation_timeout_secs".to_string(),
                format!("{}s", self.operation_timeout_secs),
            ),
        ]
    }
}
