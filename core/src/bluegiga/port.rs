//! Serial port access for BlueGiga dongles.
//!
//! The BLED112 enumerates as a USB CDC device; line settings are 8N1 without
//! flow control.

use crate::config::AdapterConfig;
use crate::error::BluetoothError;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

/// Open the port named in `config`
pub fn open(config: &AdapterConfig) -> Result<SerialStream, BluetoothError> {
    let path = config
        .port
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| BluetoothError::Configuration("no serial port configured".to_string()))?;

    info!("Opening {} at {} baud", path, config.baud_rate);
    let stream = tokio_serial::new(path, config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .stop_bits(tokio_serial::StopBits::One)
        .parity(tokio_serial::Parity::None)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(std::io::Error::from)?;
    Ok(stream)
}

/// Serial ports that look like they could host a dongle
pub fn available_ports() -> Result<Vec<String>, BluetoothError> {
    let ports = tokio_serial::available_ports().map_err(std::io::Error::from)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
