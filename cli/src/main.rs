// blegate: operator CLI for BlueGiga BLE dongles
//
// Scans, inspects and reads/writes GATT characteristics through a BLED112-style
// dongle attached to a serial port.

mod config;
mod events;

use anyhow::{Context, Result};
use blegate_core::bluegiga::port;
use blegate_core::{
    uuid_from_u16, BlueGigaAdapter, BluetoothAdapter, BluetoothAddress, CompletionStatus,
    ConnectionState, Device,
};
use clap::{Parser, Subcommand};
use colored::*;
use events::{DeviceEvent, DeviceEvents, Discoveries};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "blegate")]
#[command(about = "blegate: BlueGiga BLE dongle tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Serial port of the dongle (overrides the config file)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show dongle identity and firmware
    Info,
    /// List serial ports
    Ports,
    /// Actively scan and list nearby devices
    Scan {
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Read a characteristic
    Read {
        #[arg(short, long)]
        address: BluetoothAddress,
        /// Characteristic UUID (16-bit short form or full)
        #[arg(short, long, conflicts_with = "handle", required_unless_present = "handle")]
        uuid: Option<String>,
        /// Attribute handle, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_handle)]
        handle: Option<u16>,
    },
    /// Write a characteristic
    Write {
        #[arg(short, long)]
        address: BluetoothAddress,
        #[arg(long, value_parser = parse_handle)]
        handle: u16,
        /// Value as hex, e.g. 0100
        #[arg(long)]
        value: String,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Info => cmd_info(cli.port).await,
        Commands::Ports => cmd_ports(),
        Commands::Scan { seconds } => cmd_scan(cli.port, seconds).await,
        Commands::Read {
            address,
            uuid,
            handle,
        } => cmd_read(cli.port, address, uuid, handle).await,
        Commands::Write {
            address,
            handle,
            value,
        } => cmd_write(cli.port, address, handle, value).await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn parse_handle(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid handle '{}': {}", s, e))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    let trimmed = s.trim_start_matches("0x");
    if trimmed.len() <= 4 {
        let short = u16::from_str_radix(trimmed, 16).context("Invalid 16-bit UUID")?;
        return Ok(uuid_from_u16(short));
    }
    Uuid::parse_str(s).context("Invalid UUID")
}

async fn open_adapter(port: Option<String>) -> Result<(Arc<BlueGigaAdapter>, config::Config)> {
    let config = config::Config::load()?;
    let mut adapter_config = config.adapter.clone();
    if port.is_some() {
        adapter_config.port = port;
    }

    tracing::debug!(port = ?adapter_config.port, baud = adapter_config.baud_rate, "Opening dongle");
    let adapter = BlueGigaAdapter::open(adapter_config)
        .context("Failed to open dongle (set a port with --port or `blegate config set port`)")?;
    let online = adapter
        .initialize()
        .await
        .context("Failed to initialize dongle")?;
    if !online {
        anyhow::bail!("Dongle is not responding: {:?}", adapter.status());
    }
    Ok((adapter, config))
}

async fn cmd_info(port: Option<String>) -> Result<()> {
    let (adapter, _config) = open_adapter(port).await?;

    println!("{}", "BlueGiga Adapter".bold());
    println!();
    if let Some(info) = adapter.info() {
        println!("  {:<18} {}", "Address:".bright_cyan(), info.address);
        println!("  {:<18} {}", "Max connections:".bright_cyan(), info.max_connections);
        if let Some(firmware) = info.firmware {
            println!("  {:<18} {}", "Firmware:".bright_cyan(), firmware.version());
            println!("  {:<18} {}", "Hardware:".bright_cyan(), firmware.hardware);
            println!("  {:<18} {}", "Protocol:".bright_cyan(), firmware.protocol_version);
            println!("  {:<18} {}", "Link layer:".bright_cyan(), firmware.ll_version);
        }
    }
    println!("  {:<18} {:?}", "Status:".bright_cyan(), adapter.status());
    println!("  {:<18} {}", "Scan mode:".bright_cyan(), adapter.scan_mode());

    adapter.close().await;
    Ok(())
}

fn cmd_ports() -> Result<()> {
    let ports = port::available_ports().context("Failed to enumerate serial ports")?;
    println!("{}", "Serial Ports".bold());
    if ports.is_empty() {
        println!("  {}", "(none found)".dimmed());
    }
    for name in ports {
        println!("  {}", name);
    }
    Ok(())
}

async fn cmd_scan(port: Option<String>, seconds: Option<u64>) -> Result<()> {
    let (adapter, config) = open_adapter(port).await?;
    let seconds = seconds.unwrap_or(config.scan_seconds);

    let (listener, mut discovered) = Discoveries::channel();
    let _subscription = adapter.add_discovery_listener(listener);

    if !adapter.scan_start().await? {
        anyhow::bail!("Dongle rejected the scan request");
    }
    println!("{} Scanning for {}s (Ctrl-C to stop)", "✓".green(), seconds);

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            Some(device) = discovered.recv() => {
                println!(
                    "  {} {}",
                    "+".green(),
                    describe(&device)
                );
            }
        }
    }

    adapter.scan_stop().await?;
    println!();
    println!("{}", "Devices".bold());
    let mut devices = adapter.devices();
    devices.sort_by_key(|d| std::cmp::Reverse(d.rssi().unwrap_or(i8::MIN)));
    for device in devices {
        println!("  {}", describe(&device));
    }

    adapter.close().await;
    Ok(())
}

fn describe(device: &Device) -> String {
    let rssi = device
        .rssi()
        .map(|r| format!("{} dBm", r))
        .unwrap_or_else(|| "-".to_string());
    let name = device.name().unwrap_or_else(|| "(unnamed)".to_string());
    let manufacturer = device
        .manufacturer_id()
        .map(|m| format!(" mfr {:#06x}", m))
        .unwrap_or_default();
    format!(
        "{} {:>8}  {}{}",
        device.address().to_string().bright_cyan(),
        rssi,
        name,
        manufacturer.dimmed()
    )
}

/// Connect and wait for the link
async fn establish(
    device: &Arc<Device>,
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<DeviceEvent>,
    limit: Duration,
) -> Result<()> {
    if device.connection_state().is_connected() {
        return Ok(());
    }
    if !device.connect().await? {
        anyhow::bail!("Dongle refused to connect to {}", device.address());
    }
    events::wait_for(rx, limit, "connection", |e| match e {
        DeviceEvent::State(ConnectionState::Connected) => Some(()),
        _ => None,
    })
    .await?;
    println!("{} Connected to {}", "✓".green(), device.address());
    Ok(())
}

async fn cmd_read(
    port: Option<String>,
    address: BluetoothAddress,
    uuid: Option<String>,
    handle: Option<u16>,
) -> Result<()> {
    let (adapter, config) = open_adapter(port).await?;
    let limit = Duration::from_secs(config.operation_timeout_secs);
    let device = adapter.get_device(address);
    let (listener, mut rx) = DeviceEvents::channel();
    let _subscription = device.add_listener(listener);

    establish(&device, &mut rx, limit).await?;

    let characteristic = match (uuid, handle) {
        (_, Some(handle)) => device.attribute_for_handle(handle),
        (Some(uuid), None) => {
            let uuid = parse_uuid(&uuid)?;
            if !device.discover_services().await? {
                anyhow::bail!("Service discovery was rejected");
            }
            events::wait_for(&mut rx, limit, "service discovery", |e| match e {
                DeviceEvent::ServicesDiscovered => Some(()),
                _ => None,
            })
            .await?;
            device
                .characteristic(&uuid)
                .with_context(|| format!("{} has no characteristic {}", address, uuid))?
        }
        (None, None) => anyhow::bail!("Either --uuid or --handle is required"),
    };

    if !device.read_characteristic(&characteristic).await? {
        anyhow::bail!("Read of handle {:#06x} was rejected", characteristic.handle());
    }
    let (value, status) = events::wait_for(&mut rx, limit, "read", |e| match e {
        DeviceEvent::ReadComplete(c, status) if c.handle() == characteristic.handle() => {
            Some((c.value().to_vec(), status))
        }
        _ => None,
    })
    .await?;

    match status {
        CompletionStatus::Success => println!(
            "{} {:#06x} = {}",
            "✓".green(),
            characteristic.handle(),
            hex::encode(&value)
        ),
        CompletionStatus::Error => println!(
            "{} Read of {:#06x} failed",
            "✗".red(),
            characteristic.handle()
        ),
    }

    device.disconnect().await?;
    adapter.close().await;
    Ok(())
}

async fn cmd_write(
    port: Option<String>,
    address: BluetoothAddress,
    handle: u16,
    value: String,
) -> Result<()> {
    let bytes = hex::decode(value.trim_start_matches("0x")).context("Value must be hex")?;
    let (adapter, config) = open_adapter(port).await?;
    let limit = Duration::from_secs(config.operation_timeout_secs);
    let device = adapter.get_device(address);
    let (listener, mut rx) = DeviceEvents::channel();
    let _subscription = device.add_listener(listener);

    establish(&device, &mut rx, limit).await?;

    let characteristic = device.attribute_for_handle(handle);
    if !device.write_characteristic(&characteristic, &bytes).await? {
        anyhow::bail!("Write to {:#06x} was rejected", handle);
    }
    let status = events::wait_for(&mut rx, limit, "write", |e| match e {
        DeviceEvent::WriteComplete(c, status) if c.handle() == handle => Some(status),
        _ => None,
    })
    .await?;

    match status {
        CompletionStatus::Success => {
            println!("{} Wrote {} to {:#06x}", "✓".green(), hex::encode(&bytes), handle)
        }
        CompletionStatus::Error => println!("{} Write to {:#06x} failed", "✗".red(), handle),
    }

    device.disconnect().await?;
    adapter.close().await;
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else if config.list().iter().any(|(k, _)| *k == key) {
                println!("{} = {}", key.bright_cyan(), "(not set)".dimmed());
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handle_forms() {
        assert_eq!(parse_handle("0x0020"), Ok(0x20));
        assert_eq!(parse_handle("32"), Ok(32));
        assert!(parse_handle("0xZZ").is_err());
    }

    #[test]
    fn test_parse_uuid_forms() {
        assert_eq!(parse_uuid("2a19").unwrap(), uuid_from_u16(0x2A19));
        assert_eq!(parse_uuid("0x2A19").unwrap(), uuid_from_u16(0x2A19));
        assert_eq!(
            parse_uuid("00002a19-0000-1000-8000-00805f9b34fb").unwrap(),
            uuid_from_u16(0x2A19)
        );
    }

    #[test]
    fn test_cli_requires_handle_or_uuid() {
        assert!(Cli::try_parse_from(["blegate", "read", "--address", "aa:bb:cc:dd:ee:ff"]).is_err());
        assert!(Cli::try_parse_from([
            "blegate",
            "read",
            "--address",
            "aa:bb:cc:dd:ee:ff",
            "--handle",
            "0x20"
        ])
        .is_ok());
    }
}
