//! Adapter configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors for configuration validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid scan parameters: {0}")]
    InvalidScanParameters(String),
    #[error("Invalid connection parameters: {0}")]
    InvalidConnectionParameters(String),
    #[error("Transaction timeout must be > 0")]
    ZeroTimeout,
    #[error("Baud rate must be > 0")]
    ZeroBaudRate,
}

/// Scan interval and window, in controller units of 0.625 ms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParameters {
    pub interval: u16,
    pub window: u16,
}

impl ScanParameters {
    /// Background observation: short window so beacons are still heard
    pub const PASSIVE: ScanParameters = ScanParameters {
        interval: 0x40,
        window: 0x08,
    };

    /// Inclusion scanning: wider window and scan requests for richer data
    pub const ACTIVE: ScanParameters = ScanParameters {
        interval: 0x40,
        window: 0x20,
    };

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 || self.window == 0 {
            return Err(ConfigError::InvalidScanParameters(
                "Scan interval and window must be > 0".to_string(),
            ));
        }
        if self.window > self.interval {
            return Err(ConfigError::InvalidScanParameters(
                "Scan window must be <= scan interval".to_string(),
            ));
        }
        Ok(())
    }
}

/// Link parameters requested when initiating a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Minimum connection interval (1.25 ms units)
    pub interval_min: u16,
    /// Maximum connection interval (1.25 ms units)
    pub interval_max: u16,
    /// Slave latency in connection events
    pub latency: u16,
    /// Supervision timeout (10 ms units)
    pub supervision_timeout: u16,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            interval_min: 60,
            interval_max: 100,
            latency: 0,
            supervision_timeout: 100,
        }
    }
}

impl ConnectionParameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_min > self.interval_max {
            return Err(ConfigError::InvalidConnectionParameters(
                "interval_min must be <= interval_max".to_string(),
            ));
        }
        if self.supervision_timeout == 0 {
            return Err(ConfigError::InvalidConnectionParameters(
                "Supervision timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a BlueGiga serial adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Serial device path (e.g. "/dev/ttyACM0", "COM3")
    pub port: Option<String>,
    pub baud_rate: u32,
    /// How long a transaction waits for its response
    pub transaction_timeout_ms: u64,
    pub passive_scan: ScanParameters,
    pub active_scan: ScanParameters,
    pub connection: ConnectionParameters,
    /// Attempts made while every connection slot is in use
    pub connect_retries: u32,
    pub connect_retry_delay_ms: u64,
    /// How long a started connect procedure holds a slot before its link is reported
    pub connect_reservation_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            transaction_timeout_ms: 2_000,
            passive_scan: ScanParameters::PASSIVE,
            active_scan: ScanParameters::ACTIVE,
            connection: ConnectionParameters::default(),
            connect_retries: 3,
            connect_retry_delay_ms: 100,
            connect_reservation_ms: 5_000,
        }
    }
}

impl AdapterConfig {
    /// Default configuration for a given serial port
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transaction_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::ZeroBaudRate);
        }
        self.passive_scan.validate()?;
        self.active_scan.validate()?;
        self.connection.validate()?;
        Ok(())
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn connect_reservation(&self) -> Duration {
        Duration::from_millis(self.connect_reservation_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_dongle_tuning() {
        let config = AdapterConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.passive_scan, ScanParameters { interval: 0x40, window: 0x08 });
        assert_eq!(config.active_scan, ScanParameters { interval: 0x40, window: 0x20 });
        assert_eq!(config.connection.interval_min, 60);
        assert_eq!(config.connection.interval_max, 100);
        assert_eq!(config.connect_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_window_exceeding_interval_rejected() {
        let config = AdapterConfig {
            passive_scan: ScanParameters { interval: 0x10, window: 0x20 },
            ..AdapterConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidScanParameters(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = AdapterConfig {
            transaction_timeout_ms: 0,
            ..AdapterConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout));
    }

    #[test]
    fn test_connection_interval_order() {
        let params = ConnectionParameters {
            interval_min: 200,
            interval_max: 100,
            ..ConnectionParameters::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AdapterConfig =
            serde_json::from_str(r#"{ "port": "/dev/ttyACM0", "transaction_timeout_ms": 500 }"#)
                .unwrap();
        assert_eq!(config.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.transaction_timeout(), Duration::from_millis(500));
        assert_eq!(config.active_scan, ScanParameters::ACTIVE);
    }
}
