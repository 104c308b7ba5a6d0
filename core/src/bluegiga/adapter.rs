//! BlueGiga BLED112 adapter.
//!
//! Drives a BGAPI dongle through the [`SerialHandler`] transaction channel, keeps
//! the device registry and connection table, and turns unsolicited events into
//! device state changes and listener callbacks.

use super::command::BgCommand;
use super::message::{BgEvent, BgResponse, FirmwareInfo};
use super::port;
use super::procedure::{GattProcedure, ProcedureTable};
use super::serial::{BgEventListener, SerialHandler};
use super::types::{
    AttributeValueType, BgAddressType, BgApiResponse, GapConnectableMode, GapDiscoverMode,
    GapDiscoverableMode,
};
use crate::adapter::{
    AdapterStatus, BluetoothAdapter, DiscoveryListener, OfflineReason, ScanMode,
};
use crate::address::{AddressType, BluetoothAddress};
use crate::config::{AdapterConfig, ScanParameters};
use crate::device::{BondState, ConnectionHandle, Device, GattBackend};
use crate::error::BluetoothError;
use crate::gatt::{
    uuid_to_u16, Characteristic, CompletionStatus, Service,
    CHARACTERISTIC_DECLARATION_UUID, PRIMARY_SERVICE_UUID,
};
use crate::listener::{ListenerSet, Subscription};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Full attribute handle range
const FIRST_HANDLE: u16 = 0x0001;
const LAST_HANDLE: u16 = 0xFFFF;

/// Bond field value meaning "no bond"
const NO_BOND: u8 = 0xFF;

/// Identity of the dongle, gathered during [`BlueGigaAdapter::initialize`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub address: BluetoothAddress,
    pub firmware: Option<FirmwareInfo>,
    pub max_connections: u8,
}

/// A connect procedure the dongle accepted but has not yet reported as a link
struct ConnectReservation {
    /// Handle from the connect_direct response, once it is known
    handle: Option<ConnectionHandle>,
    since: Instant,
}

impl ConnectReservation {
    fn new() -> Self {
        Self {
            handle: None,
            since: Instant::now(),
        }
    }
}

struct AdapterState {
    status: AdapterStatus,
    scan_mode: ScanMode,
    address: Option<BluetoothAddress>,
    firmware: Option<FirmwareInfo>,
    max_connections: Option<u8>,
}

/// Forwards channel events to the adapter without keeping it alive
struct EventForwarder {
    adapter: Weak<BlueGigaAdapter>,
}

impl BgEventListener for EventForwarder {
    fn bluegiga_event_received(&self, event: &BgEvent) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.handle_event(event);
        }
    }

    fn channel_closed(&self) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.channel_lost();
        }
    }
}

/// Bluetooth adapter backed by a BlueGiga BGAPI dongle
pub struct BlueGigaAdapter {
    this: Weak<BlueGigaAdapter>,
    config: AdapterConfig,
    channel: SerialHandler,
    state: RwLock<AdapterState>,
    devices: RwLock<HashMap<BluetoothAddress, Arc<Device>>>,
    /// Live links reported by the dongle
    connections: RwLock<HashMap<ConnectionHandle, BluetoothAddress>>,
    /// Connect procedures started but not yet reported as established
    pending_connects: Mutex<HashMap<BluetoothAddress, ConnectReservation>>,
    procedures: ProcedureTable,
    discovery_listeners: ListenerSet<dyn DiscoveryListener>,
    connect_lock: tokio::sync::Mutex<()>,
    _events: Subscription,
}

impl BlueGigaAdapter {
    /// Build an adapter over an already open byte stream. Starts the channel's
    /// reader task, so this must run inside a tokio runtime. Call
    /// [`initialize`](Self::initialize) before use.
    pub fn new<S>(stream: S, config: AdapterConfig) -> Result<Arc<Self>, BluetoothError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config
            .validate()
            .map_err(|e| BluetoothError::Configuration(e.to_string()))?;

        Ok(Arc::new_cyclic(|this: &Weak<Self>| {
            let channel = SerialHandler::new(stream, config.transaction_timeout());
            let events = channel.add_event_listener(Arc::new(EventForwarder {
                adapter: this.clone(),
            }));
            Self {
                this: this.clone(),
                config,
                channel,
                state: RwLock::new(AdapterState {
                    status: AdapterStatus::Unknown,
                    scan_mode: ScanMode::Off,
                    address: None,
                    firmware: None,
                    max_connections: None,
                }),
                devices: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
                pending_connects: Mutex::new(HashMap::new()),
                procedures: ProcedureTable::new(),
                discovery_listeners: ListenerSet::new(),
                connect_lock: tokio::sync::Mutex::new(()),
                _events: events,
            }
        }))
    }

    /// Open the serial port named in `config` and build an adapter on it
    pub fn open(config: AdapterConfig) -> Result<Arc<Self>, BluetoothError> {
        let stream = port::open(&config)?;
        Self::new(stream, config)
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Bring the dongle to a known idle state: stop any running procedure, drop
    /// stale links, read its identity, make it non-connectable and
    /// non-discoverable, then start passive scanning.
    ///
    /// Returns `Ok(false)` if the dongle does not report its address; the
    /// adapter is then offline.
    pub async fn initialize(&self) -> Result<bool, BluetoothError> {
        info!("Initializing BlueGiga adapter");
        match self.reset().await {
            Ok(online) => Ok(online),
            Err(e) => {
                self.set_status(AdapterStatus::Offline(OfflineReason::CommunicationError(
                    e.to_string(),
                )));
                Err(e)
            }
        }
    }

    async fn reset(&self) -> Result<bool, BluetoothError> {
        // Whatever was running before we attached
        self.end_procedure().await?;

        let max_connections = match self.transact(BgCommand::SystemGetConnections).await? {
            Some(BgResponse::SystemGetConnections { max_connections }) => max_connections,
            Some(other) => return Err(unexpected(&other)),
            None => 0,
        };
        self.state.write().max_connections = Some(max_connections);
        debug!("Dongle supports {} connections", max_connections);

        for connection in 0..max_connections {
            self.disconnect_handle(connection).await?;
        }

        let address = match self.transact(BgCommand::SystemAddressGet).await? {
            Some(BgResponse::SystemAddressGet { address }) => address,
            Some(other) => return Err(unexpected(&other)),
            None => {
                warn!("Dongle did not report its address");
                self.set_status(AdapterStatus::Offline(OfflineReason::CommunicationError(
                    "no response to address query".to_string(),
                )));
                return Ok(false);
            }
        };
        self.state.write().address = Some(address);

        if let Some(BgResponse::SystemGetInfo(firmware)) =
            self.transact(BgCommand::SystemGetInfo).await?
        {
            info!(
                "Dongle {} firmware {} hardware {}",
                address,
                firmware.version(),
                firmware.hardware
            );
            self.state.write().firmware = Some(firmware);
        }

        self.set_mode().await?;
        self.start_scan(false).await?;

        self.set_status(AdapterStatus::Online);
        info!("BlueGiga adapter {} online", address);
        Ok(true)
    }

    /// Stop the channel and forget every live link
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            state.scan_mode = ScanMode::Off;
            state.status = AdapterStatus::Offline(OfflineReason::Closed);
        }
        self.channel.close().await;
        self.drop_all_connections();
        info!("BlueGiga adapter closed");
    }

    /// Identity gathered by `initialize`
    pub fn info(&self) -> Option<AdapterInfo> {
        let state = self.state.read();
        Some(AdapterInfo {
            address: state.address?,
            firmware: state.firmware,
            max_connections: state.max_connections?,
        })
    }

    /// Maximum concurrent links, known after `initialize`
    pub fn max_connections(&self) -> Option<u8> {
        self.state.read().max_connections
    }

    /// Number of live links in the connection table
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn connected_address(&self, handle: ConnectionHandle) -> Option<BluetoothAddress> {
        self.connections.read().get(&handle).copied()
    }

    pub fn connection_handle(&self, address: &BluetoothAddress) -> Option<ConnectionHandle> {
        self.connections
            .read()
            .iter()
            .find(|(_, a)| *a == address)
            .map(|(h, _)| *h)
    }

    /// GATT procedure currently running for a device
    pub fn procedure(&self, address: &BluetoothAddress) -> GattProcedure {
        self.procedures.get(address)
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    /// Send a command. A timeout is logged and reported as `None`; transport
    /// failures propagate.
    async fn transact(&self, command: BgCommand) -> Result<Option<BgResponse>, BluetoothError> {
        let name = command.name();
        match self.channel.send_transaction(command).await {
            Ok(response) => Ok(Some(response)),
            Err(BluetoothError::Timeout(after)) => {
                warn!("No response to {} within {:?}", name, after);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a command whose response carries a result code; true on success
    async fn transact_ok(&self, command: BgCommand) -> Result<bool, BluetoothError> {
        let name = command.name();
        match self.transact(command).await? {
            Some(response) => {
                let result = response.result().unwrap_or(BgApiResponse::Unknown(0xFFFF));
                if !result.is_success() {
                    debug!("{} rejected: {}", name, result);
                }
                Ok(result.is_success())
            }
            None => Ok(false),
        }
    }

    async fn end_procedure(&self) -> Result<bool, BluetoothError> {
        self.transact_ok(BgCommand::GapEndProcedure).await
    }

    async fn set_mode(&self) -> Result<bool, BluetoothError> {
        self.transact_ok(BgCommand::GapSetMode {
            discover: GapDiscoverableMode::NonDiscoverable,
            connect: GapConnectableMode::NonConnectable,
        })
        .await
    }

    async fn start_scan(&self, active: bool) -> Result<bool, BluetoothError> {
        let ScanParameters { interval, window } = if active {
            self.config.active_scan
        } else {
            self.config.passive_scan
        };
        let configured = self
            .transact_ok(BgCommand::GapSetScanParameters {
                scan_interval: interval,
                scan_window: window,
                active,
            })
            .await?;
        if !configured {
            return Ok(false);
        }
        let started = self
            .transact_ok(BgCommand::GapDiscover {
                mode: GapDiscoverMode::Observation,
            })
            .await?;
        if started {
            let mode = if active {
                ScanMode::Active
            } else {
                ScanMode::Passive
            };
            self.state.write().scan_mode = mode;
            debug!("Scan mode now {}", mode);
        }
        Ok(started)
    }

    /// Connect to `address`. Returns false without sending anything if a link
    /// or connect procedure to it already exists, or if every connection slot
    /// stays occupied through the bounded retries.
    pub async fn connect_address(
        &self,
        address: BluetoothAddress,
        address_type: AddressType,
    ) -> Result<bool, BluetoothError> {
        let max = self.max_connections().ok_or(BluetoothError::NotInitialized)?;
        let _guard = self.connect_lock.lock().await;

        if self.connection_handle(&address).is_some() || self.is_connect_pending(&address) {
            debug!("{} already connected or connecting", address);
            return Ok(false);
        }

        let attempts = self.config.connect_retries.max(1);
        let mut attempt = 1;
        while self.occupied_slots() >= usize::from(max) {
            if attempt >= attempts {
                debug!("No free connection slot for {} after {} attempts", address, attempt);
                return Ok(false);
            }
            attempt += 1;
            tokio::time::sleep(self.config.connect_retry_delay()).await;
        }

        // Reserve before sending so an early link report is not counted twice
        self.pending_connects
            .lock()
            .insert(address, ConnectReservation::new());

        match self.send_connect(address, address_type).await {
            Ok(Some(handle)) => {
                // Absent if the link was already reported
                if let Some(reservation) = self.pending_connects.lock().get_mut(&address) {
                    reservation.handle = Some(handle);
                }
                let device = self.devices.read().get(&address).cloned();
                if let Some(device) = device {
                    device.mark_connecting();
                }
                Ok(true)
            }
            Ok(None) => {
                self.pending_connects.lock().remove(&address);
                Ok(false)
            }
            Err(e) => {
                self.pending_connects.lock().remove(&address);
                Err(e)
            }
        }
    }

    /// Issue connect_direct; the handle the dongle assigned if it accepted
    async fn send_connect(
        &self,
        address: BluetoothAddress,
        address_type: AddressType,
    ) -> Result<Option<ConnectionHandle>, BluetoothError> {
        self.set_mode().await?;
        let params = self.config.connection;
        let response = self
            .transact(BgCommand::GapConnectDirect {
                address,
                address_type: BgAddressType::from(address_type),
                conn_interval_min: params.interval_min,
                conn_interval_max: params.interval_max,
                timeout: params.supervision_timeout,
                latency: params.latency,
            })
            .await?;
        match response {
            Some(BgResponse::GapConnectDirect { result, connection }) => {
                if result.is_success() {
                    debug!("Connecting to {} on handle {}", address, connection);
                    Ok(Some(connection))
                } else {
                    debug!("Connect to {} rejected: {}", address, result);
                    Ok(None)
                }
            }
            Some(other) => Err(unexpected(&other)),
            None => Ok(None),
        }
    }

    /// Close the link on `handle`
    pub async fn disconnect_handle(&self, handle: ConnectionHandle) -> Result<bool, BluetoothError> {
        self.transact_ok(BgCommand::ConnectionDisconnect { connection: handle })
            .await
    }

    /// Start primary service enumeration; results arrive as group_found events
    pub async fn find_primary_services(&self, handle: ConnectionHandle) -> Result<bool, BluetoothError> {
        self.transact_ok(BgCommand::AttClientReadByGroupType {
            connection: handle,
            start: FIRST_HANDLE,
            end: LAST_HANDLE,
            group_type: PRIMARY_SERVICE_UUID.to_le_bytes().to_vec(),
        })
        .await
    }

    /// Start attribute enumeration over the full handle range
    pub async fn find_characteristics(&self, handle: ConnectionHandle) -> Result<bool, BluetoothError> {
        self.transact_ok(BgCommand::AttClientFindInformation {
            connection: handle,
            start: FIRST_HANDLE,
            end: LAST_HANDLE,
        })
        .await
    }

    pub async fn read_attribute(
        &self,
        handle: ConnectionHandle,
        attribute: u16,
    ) -> Result<bool, BluetoothError> {
        self.transact_ok(BgCommand::AttClientReadByHandle {
            connection: handle,
            handle: attribute,
        })
        .await
    }

    pub async fn write_attribute(
        &self,
        handle: ConnectionHandle,
        attribute: u16,
        value: &[u8],
    ) -> Result<bool, BluetoothError> {
        self.transact_ok(BgCommand::AttClientAttributeWrite {
            connection: handle,
            handle: attribute,
            data: value.to_vec(),
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Registry and connection table
    // ---------------------------------------------------------------------

    fn backend(&self) -> Weak<dyn GattBackend> {
        let backend: Weak<dyn GattBackend> = self.this.clone();
        backend
    }

    fn device_entry(&self, address: BluetoothAddress, address_type: AddressType) -> Arc<Device> {
        if let Some(device) = self.devices.read().get(&address) {
            return Arc::clone(device);
        }
        let mut devices = self.devices.write();
        let device = devices.entry(address).or_insert_with(|| {
            debug!("Registering device {}", address);
            Arc::new(Device::new(address, address_type, self.backend()))
        });
        Arc::clone(device)
    }

    fn device_for_connection(&self, handle: ConnectionHandle) -> Option<Arc<Device>> {
        let address = self.connected_address(handle)?;
        self.devices.read().get(&address).cloned()
    }

    fn is_connect_pending(&self, address: &BluetoothAddress) -> bool {
        let ttl = self.config.connect_reservation();
        let mut pending = self.pending_connects.lock();
        pending.retain(|_, r| r.since.elapsed() < ttl);
        pending.contains_key(address)
    }

    /// Drop the reservation waiting on `handle`, returning its address
    fn release_reservation(&self, handle: ConnectionHandle) -> Option<BluetoothAddress> {
        let mut pending = self.pending_connects.lock();
        let address = pending
            .iter()
            .find(|(_, r)| r.handle == Some(handle))
            .map(|(a, _)| *a)?;
        pending.remove(&address);
        Some(address)
    }

    /// Live links plus unexpired reservations for addresses not yet linked
    fn occupied_slots(&self) -> usize {
        let connected: HashSet<BluetoothAddress> =
            self.connections.read().values().copied().collect();
        let ttl = self.config.connect_reservation();
        let mut pending = self.pending_connects.lock();
        pending.retain(|_, r| r.since.elapsed() < ttl);
        connected.len() + pending.keys().filter(|a| !connected.contains(a)).count()
    }

    fn drop_all_connections(&self) {
        let dropped: Vec<BluetoothAddress> = self.connections.write().drain().map(|(_, a)| a).collect();
        self.pending_connects.lock().clear();
        for address in dropped {
            self.procedures.finish(&address);
            let device = self.devices.read().get(&address).cloned();
            if let Some(device) = device {
                device.mark_disconnected();
            }
        }
    }

    fn set_status(&self, status: AdapterStatus) {
        let mut state = self.state.write();
        if state.status != status {
            debug!("Adapter status {:?} -> {:?}", state.status, status);
            state.status = status;
        }
    }

    fn announce(&self, device: &Arc<Device>) {
        self.discovery_listeners
            .notify("device discovered", |l| l.device_discovered(device));
    }

    fn channel_lost(&self) {
        let closed = matches!(
            self.state.read().status,
            AdapterStatus::Offline(OfflineReason::Closed)
        );
        if !closed {
            warn!("BGAPI channel lost");
            self.set_status(AdapterStatus::Offline(OfflineReason::CommunicationError(
                "serial stream closed".to_string(),
            )));
        }
    }

    // ---------------------------------------------------------------------
    // Event handling (runs on the channel's reader task)
    // ---------------------------------------------------------------------

    fn handle_event(&self, event: &BgEvent) {
        match event {
            BgEvent::SystemBoot(firmware) => {
                warn!("Dongle rebooted (firmware {})", firmware.version());
                self.drop_all_connections();
                self.state.write().scan_mode = ScanMode::Off;
            }
            BgEvent::GapScanResponse {
                rssi,
                sender,
                address_type,
                bond,
                data,
                ..
            } => self.handle_scan_response(*sender, *address_type, *rssi, *bond, data),
            BgEvent::ConnectionStatus {
                connection,
                flags,
                address,
                ..
            } => {
                if flags.is_connected() {
                    self.handle_connected(*connection, *address);
                }
            }
            BgEvent::ConnectionDisconnected { connection, reason } => {
                self.handle_disconnected(*connection, *reason)
            }
            BgEvent::AttClientGroupFound {
                connection,
                start,
                end,
                uuid,
            } => {
                if let Some(device) = self.device_for_connection(*connection) {
                    debug!("{}: service {} [{:#06x}..{:#06x}]", device.address(), uuid, start, end);
                    device.add_service(Service::new(*uuid, true, *start, *end));
                }
            }
            BgEvent::AttClientFindInformationFound {
                connection,
                handle,
                uuid,
            } => {
                if let Some(device) = self.device_for_connection(*connection) {
                    record_attribute(&device, *handle, *uuid);
                }
            }
            BgEvent::AttClientAttributeValue {
                connection,
                handle,
                value_type,
                value,
            } => self.handle_attribute_value(*connection, *handle, *value_type, value),
            BgEvent::AttClientProcedureCompleted {
                connection,
                result,
                handle,
            } => self.handle_procedure_completed(*connection, *result, *handle),
        }
    }

    fn handle_scan_response(
        &self,
        sender: BluetoothAddress,
        address_type: BgAddressType,
        rssi: i8,
        bond: u8,
        data: &[u8],
    ) {
        let address_type = AddressType::from(address_type);
        let device = self.device_entry(sender, address_type);
        let bond_state = if bond == NO_BOND {
            BondState::NotBonded
        } else {
            BondState::Bonded(bond)
        };
        if device.record_sighting(address_type, rssi, bond_state, data) {
            debug!("Discovered {} rssi {}", sender, rssi);
            self.announce(&device);
        }
    }

    fn handle_connected(&self, handle: ConnectionHandle, address: BluetoothAddress) {
        {
            let mut connections = self.connections.write();
            connections.retain(|h, a| *h == handle || *a != address);
            connections.insert(handle, address);
        }
        self.pending_connects.lock().remove(&address);
        info!("Connected to {} on handle {}", address, handle);
        self.device_entry(address, AddressType::Unknown)
            .mark_connected(handle);
    }

    fn handle_disconnected(&self, handle: ConnectionHandle, reason: BgApiResponse) {
        let linked = self.connections.write().remove(&handle);
        let address = match linked {
            Some(address) => {
                info!("Disconnected from {} ({})", address, reason);
                address
            }
            // Link setup failed before a connection status arrived
            None => match self.release_reservation(handle) {
                Some(address) => {
                    info!("Connect to {} failed on handle {} ({})", address, handle, reason);
                    address
                }
                None => {
                    debug!("Disconnect for unknown handle {}", handle);
                    return;
                }
            },
        };
        let interrupted = self.procedures.finish(&address);
        if interrupted != GattProcedure::Idle {
            debug!("{}: {} interrupted by disconnect", address, interrupted);
        }
        let device = self.devices.read().get(&address).cloned();
        if let Some(device) = device {
            device.mark_disconnected();
        }
    }

    fn handle_attribute_value(
        &self,
        connection: ConnectionHandle,
        handle: u16,
        value_type: AttributeValueType,
        value: &[u8],
    ) {
        let Some(device) = self.device_for_connection(connection) else {
            debug!("Attribute value for unknown connection {}", connection);
            return;
        };
        let address = device.address();
        let characteristic = device.update_value(handle, value).unwrap_or_else(|| {
            let mut attribute = device.attribute_for_handle(handle);
            attribute.set_value(value.to_vec());
            attribute
        });

        // A notification can land while a read of the same handle is running
        let answers_read = !value_type.is_unsolicited()
            && self.procedures.get(&address) == GattProcedure::Read(handle);
        if answers_read {
            self.procedures.finish(&address);
            device.notify_read_complete(&characteristic, CompletionStatus::Success);
        } else {
            device.notify_characteristic_update(&characteristic);
        }
    }

    fn handle_procedure_completed(
        &self,
        connection: ConnectionHandle,
        result: BgApiResponse,
        handle: u16,
    ) {
        let Some(device) = self.device_for_connection(connection) else {
            debug!("Procedure completed on unknown connection {}", connection);
            return;
        };
        let address = device.address();
        let status = if result.is_success() {
            CompletionStatus::Success
        } else {
            CompletionStatus::Error
        };

        match self.procedures.get(&address) {
            GattProcedure::Idle => {
                debug!("{}: procedure completed ({}) with nothing running", address, result)
            }
            GattProcedure::GetServices => {
                if result.is_success() {
                    self.procedures
                        .advance(address, GattProcedure::GetCharacteristics);
                    self.spawn_find_characteristics(device, connection);
                } else {
                    debug!("{}: service discovery failed: {}", address, result);
                    self.procedures.finish(&address);
                    device.abort_service_discovery();
                }
            }
            GattProcedure::GetCharacteristics => {
                self.procedures.finish(&address);
                if result.is_success() {
                    debug!("{}: {} services discovered", address, device.services().len());
                    device.mark_ready();
                } else {
                    debug!("{}: characteristic discovery failed: {}", address, result);
                    device.abort_service_discovery();
                }
            }
            GattProcedure::Read(attribute) => {
                self.procedures.finish(&address);
                if !result.is_success() {
                    debug!("{}: read {:#06x} failed: {}", address, handle, result);
                }
                device.notify_read_complete(&device.attribute_for_handle(attribute), status);
            }
            GattProcedure::Write(attribute) => {
                self.procedures.finish(&address);
                device.notify_write_complete(&device.attribute_for_handle(attribute), status);
            }
        }
    }

    /// The next stage needs a transaction, which must not run on the reader task
    fn spawn_find_characteristics(&self, device: Arc<Device>, connection: ConnectionHandle) {
        let Some(adapter) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let address = device.address();
            let started = match adapter.find_characteristics(connection).await {
                Ok(started) => started,
                Err(e) => {
                    warn!("{}: characteristic discovery failed: {}", address, e);
                    false
                }
            };
            if !started && adapter.procedures.get(&address) == GattProcedure::GetCharacteristics {
                adapter.procedures.finish(&address);
                device.abort_service_discovery();
            }
        });
    }

    /// Claim `device` for `procedure`, run `start`, and release the claim if the
    /// procedure did not start
    async fn run_procedure<F, Fut>(
        &self,
        device: &Device,
        procedure: GattProcedure,
        start: F,
    ) -> Result<bool, BluetoothError>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: std::future::Future<Output = Result<bool, BluetoothError>>,
    {
        let address = device.address();
        let handle = self
            .connection_handle(&address)
            .ok_or(BluetoothError::NotConnected(address))?;
        if !self.procedures.begin(address, procedure) {
            debug!(
                "{}: busy with {}, rejecting {}",
                address,
                self.procedures.get(&address),
                procedure
            );
            return Ok(false);
        }

        let outcome = start(handle).await;
        if !matches!(outcome, Ok(true)) && self.procedures.get(&address) == procedure {
            self.procedures.finish(&address);
        }
        outcome
    }
}

/// Sort a find_information result into the device's catalog
fn record_attribute(device: &Device, handle: u16, uuid: Uuid) {
    match uuid_to_u16(&uuid) {
        Some(short) if (PRIMARY_SERVICE_UUID..=CHARACTERISTIC_DECLARATION_UUID).contains(&short) => {}
        Some(short) if short & 0xFF00 == 0x2900 => {
            if !device.add_descriptor(uuid, handle) {
                debug!("{}: descriptor {:#06x} has no characteristic", device.address(), handle);
            }
        }
        _ => {
            if !device.add_characteristic(Characteristic::new(uuid, handle)) {
                debug!("{}: attribute {:#06x} outside every service", device.address(), handle);
            }
        }
    }
}

fn unexpected(response: &BgResponse) -> BluetoothError {
    BluetoothError::UnexpectedResponse(format!("{:?}", response))
}

#[async_trait]
impl BluetoothAdapter for BlueGigaAdapter {
    fn address(&self) -> Option<BluetoothAddress> {
        self.state.read().address
    }

    fn status(&self) -> AdapterStatus {
        self.state.read().status.clone()
    }

    fn scan_mode(&self) -> ScanMode {
        self.state.read().scan_mode
    }

    fn get_device(&self, address: BluetoothAddress) -> Arc<Device> {
        self.device_entry(address, AddressType::Unknown)
    }

    fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().values().cloned().collect()
    }

    fn add_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) -> Subscription {
        self.discovery_listeners.add(listener)
    }

    async fn scan_start(&self) -> Result<bool, BluetoothError> {
        let started = match self.scan_mode() {
            ScanMode::Active => true,
            ScanMode::Passive => {
                if self.end_procedure().await? {
                    self.state.write().scan_mode = ScanMode::Off;
                }
                self.start_scan(true).await?
            }
            ScanMode::Off => self.start_scan(true).await?,
        };
        for device in self.devices() {
            if device.last_seen().is_some() {
                self.announce(&device);
            }
        }
        Ok(started)
    }

    async fn scan_stop(&self) -> Result<bool, BluetoothError> {
        if self.scan_mode() != ScanMode::Active {
            debug!("No active scan to stop");
            return Ok(false);
        }
        self.end_procedure().await?;
        self.state.write().scan_mode = ScanMode::Off;
        self.start_scan(false).await
    }
}

#[async_trait]
impl GattBackend for BlueGigaAdapter {
    async fn connect(&self, device: &Device) -> Result<bool, BluetoothError> {
        self.connect_address(device.address(), device.address_type())
            .await
    }

    async fn disconnect(&self, device: &Device) -> Result<bool, BluetoothError> {
        match self.connection_handle(&device.address()) {
            Some(handle) => self.disconnect_handle(handle).await,
            None => {
                debug!("{} is not connected", device.address());
                Ok(false)
            }
        }
    }

    async fn discover_services(&self, device: &Device) -> Result<bool, BluetoothError> {
        self.run_procedure(device, GattProcedure::GetServices, |handle| async move {
            device.mark_service_discovery();
            let started = self.find_primary_services(handle).await;
            if !matches!(started, Ok(true)) {
                device.abort_service_discovery();
            }
            started
        })
        .await
    }

    async fn read_characteristic(
        &self,
        device: &Device,
        characteristic: &Characteristic,
    ) -> Result<bool, BluetoothError> {
        let attribute = characteristic.handle();
        self.run_procedure(device, GattProcedure::Read(attribute), |handle| {
            self.read_attribute(handle, attribute)
        })
        .await
    }

    async fn write_characteristic(
        &self,
        device: &Device,
        handle: u16,
        value: &[u8],
    ) -> Result<bool, BluetoothError> {
        self.run_procedure(device, GattProcedure::Write(handle), |connection| {
            self.write_attribute(connection, handle, value)
        })
        .await
    }
}

impl std::fmt::Debug for BlueGigaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("BlueGigaAdapter")
            .field("port", &self.config.port)
            .field("address", &state.address)
            .field("status", &state.status)
            .field("scan_mode", &state.scan_mode)
            .field("connections", &self.connections.read().len())
            .field("devices", &self.devices.read().len())
            .finish()
    }
}
