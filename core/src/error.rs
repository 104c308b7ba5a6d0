//! Error types shared by the adapter abstraction and its backends.

use crate::address::BluetoothAddress;
use crate::bluegiga::frame::FrameError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by adapters, devices and the transaction channel.
///
/// Protocol status failures (the dongle answered but rejected the request) are
/// not errors: operations report them as `Ok(false)`.
#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transaction timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transaction channel closed")]
    ChannelClosed,
    #[error("Adapter not initialized")]
    NotInitialized,
    #[error("Adapter no longer available")]
    AdapterGone,
    #[error("Device {0} is not connected")]
    NotConnected(BluetoothAddress),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

impl BluetoothError {
    /// True for failures of the underlying byte stream rather than of a single request.
    pub fn is_transport(&self) -> bool {
        matches!(self, BluetoothError::Io(_) | BluetoothError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let io = BluetoothError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_transport());
        assert!(BluetoothError::ChannelClosed.is_transport());
        assert!(!BluetoothError::Timeout(Duration::from_millis(5)).is_transport());
        assert!(!BluetoothError::NotInitialized.is_transport());
    }

    #[test]
    fn test_error_display() {
        let err = BluetoothError::Configuration("Serial port must be configured".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Serial port must be configured"
        );
    }
}
