//! Adapter abstraction shared by all transport backends

use crate::address::BluetoothAddress;
use crate::device::Device;
use crate::error::BluetoothError;
use crate::listener::Subscription;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Scanning procedure currently running on the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanMode {
    Off,
    /// Background observation: advertisements only, no scan requests
    Passive,
    /// Inclusion scanning: scan requests sent for richer data
    Active,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Off => write!(f, "off"),
            ScanMode::Passive => write!(f, "passive"),
            ScanMode::Active => write!(f, "active"),
        }
    }
}

/// Why an adapter is offline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfflineReason {
    /// Required transport parameter missing or invalid; not retried
    ConfigurationError(String),
    /// Transport did not answer as expected
    CommunicationError(String),
    /// Adapter was closed
    Closed,
}

/// Lifecycle status of an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterStatus {
    /// Created, initialization not finished
    Unknown,
    Online,
    Offline(OfflineReason),
}

/// Receives devices seen for the first time (and re-announcements on scan start)
pub trait DiscoveryListener: Send + Sync {
    fn device_discovered(&self, device: &Arc<Device>);
}

/// Operation surface every adapter backend exposes to consumers
#[async_trait]
pub trait BluetoothAdapter: Send + Sync {
    /// Our own hardware address, once known
    fn address(&self) -> Option<BluetoothAddress>;

    fn status(&self) -> AdapterStatus;

    fn scan_mode(&self) -> ScanMode;

    /// Always returns a device, registering a placeholder for unknown addresses
    fn get_device(&self, address: BluetoothAddress) -> Arc<Device>;

    /// All devices currently in the registry
    fn devices(&self) -> Vec<Arc<Device>>;

    fn add_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) -> Subscription;

    /// Switch to active scanning and re-announce every known device
    async fn scan_start(&self) -> Result<bool, BluetoothError>;

    /// Return to passive scanning; no-op when no active scan is running
    async fn scan_stop(&self) -> Result<bool, BluetoothError>;
}
