//! Transport-agnostic device model.
//!
//! A [`Device`] is owned by its adapter's registry, one instance per address.
//! Backends drive its connection state machine from transport events and
//! perform GATT operations through the [`GattBackend`] capability trait.

use crate::address::{AddressType, BluetoothAddress};
use crate::advertisement::AdvertisementData;
use crate::error::BluetoothError;
use crate::gatt::{
    uuid_from_u16, Characteristic, CompletionStatus, Descriptor, Service,
    CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
};
use crate::listener::{ListenerSet, Subscription};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

/// Link identifier assigned by the controller firmware
pub type ConnectionHandle = u8;

/// Per-device connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Known by address only
    Idle,
    /// Seen in a scan
    Discovered,
    /// Connect request accepted by the transport, link not up yet
    Connecting,
    /// Link established
    Connected,
    /// GATT service/characteristic enumeration running
    ServiceDiscovery,
    /// Services enumerated, ready for reads and writes
    Ready,
    /// Link lost or closed; may re-enter `Connecting`
    Disconnected,
}

impl ConnectionState {
    /// True while a link to the device is up
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::ServiceDiscovery | ConnectionState::Ready
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Discovered => "discovered",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ServiceDiscovery => "servicediscovery",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
        };
        write!(f, "{}", name)
    }
}

/// Bonding information reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondState {
    NotBonded,
    /// Bonded, with the controller's bond slot
    Bonded(u8),
}

/// Scan sighting delivered to device listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanNotification {
    pub address: BluetoothAddress,
    pub rssi: i8,
    pub advertisement: AdvertisementData,
    /// Raw advertising payload
    pub data: Vec<u8>,
}

/// Connection state change delivered to device listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatusNotification {
    pub address: BluetoothAddress,
    pub state: ConnectionState,
}

/// Callbacks for a single device. All methods default to no-ops.
///
/// Callbacks run on the transport's event task and must not block.
pub trait DeviceListener: Send + Sync {
    fn on_scan_record_received(&self, _notification: &ScanNotification) {}
    fn on_connection_state_change(&self, _notification: &ConnectionStatusNotification) {}
    fn on_services_discovered(&self) {}
    fn on_characteristic_read_complete(&self, _characteristic: &Characteristic, _status: CompletionStatus) {}
    fn on_characteristic_write_complete(&self, _characteristic: &Characteristic, _status: CompletionStatus) {}
    fn on_characteristic_update(&self, _characteristic: &Characteristic) {}
}

/// GATT capabilities a transport backend provides for its devices.
///
/// Each call issues one request; `Ok(false)` means the transport rejected it or
/// did not answer in time, `Err` means the transport itself failed.
#[async_trait]
pub trait GattBackend: Send + Sync {
    async fn connect(&self, device: &Device) -> Result<bool, BluetoothError>;
    async fn disconnect(&self, device: &Device) -> Result<bool, BluetoothError>;
    async fn discover_services(&self, device: &Device) -> Result<bool, BluetoothError>;
    async fn read_characteristic(
        &self,
        device: &Device,
        characteristic: &Characteristic,
    ) -> Result<bool, BluetoothError>;
    async fn write_characteristic(
        &self,
        device: &Device,
        handle: u16,
        value: &[u8],
    ) -> Result<bool, BluetoothError>;
}

#[derive(Debug)]
struct DeviceState {
    address_type: AddressType,
    name: Option<String>,
    rssi: Option<i8>,
    tx_power: Option<i8>,
    manufacturer_id: Option<u16>,
    bond_state: BondState,
    services: Vec<Service>,
    connection_state: ConnectionState,
    connection_handle: Option<ConnectionHandle>,
    last_seen: Option<SystemTime>,
}

/// A remote Bluetooth device known to an adapter
pub struct Device {
    address: BluetoothAddress,
    state: RwLock<DeviceState>,
    listeners: ListenerSet<dyn DeviceListener>,
    backend: Weak<dyn GattBackend>,
}

impl Device {
    /// Create a device bound to a backend. The backend is held weakly; operations
    /// fail with [`BluetoothError::AdapterGone`] once it is dropped.
    pub fn new(
        address: BluetoothAddress,
        address_type: AddressType,
        backend: Weak<dyn GattBackend>,
    ) -> Self {
        Self {
            address,
            state: RwLock::new(DeviceState {
                address_type,
                name: None,
                rssi: None,
                tx_power: None,
                manufacturer_id: None,
                bond_state: BondState::NotBonded,
                services: Vec::new(),
                connection_state: ConnectionState::Idle,
                connection_handle: None,
                last_seen: None,
            }),
            listeners: ListenerSet::new(),
            backend,
        }
    }

    pub fn address(&self) -> BluetoothAddress {
        self.address
    }

    pub fn address_type(&self) -> AddressType {
        self.state.read().address_type
    }

    pub fn name(&self) -> Option<String> {
        self.state.read().name.clone()
    }

    pub fn rssi(&self) -> Option<i8> {
        self.state.read().rssi
    }

    pub fn tx_power(&self) -> Option<i8> {
        self.state.read().tx_power
    }

    pub fn manufacturer_id(&self) -> Option<u16> {
        self.state.read().manufacturer_id
    }

    pub fn bond_state(&self) -> BondState {
        self.state.read().bond_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        self.state.read().connection_handle
    }

    /// When the device was last heard in a scan
    pub fn last_seen(&self) -> Option<SystemTime> {
        self.state.read().last_seen
    }

    /// Snapshot of the discovered service catalog
    pub fn services(&self) -> Vec<Service> {
        self.state.read().services.clone()
    }

    pub fn service(&self, uuid: &Uuid) -> Option<Service> {
        self.state
            .read()
            .services
            .iter()
            .find(|s| s.uuid() == *uuid)
            .cloned()
    }

    /// Find a characteristic by UUID across all services
    pub fn characteristic(&self, uuid: &Uuid) -> Option<Characteristic> {
        self.state
            .read()
            .services
            .iter()
            .find_map(|s| s.characteristic(uuid))
            .cloned()
    }

    /// Find a characteristic by its value handle
    pub fn characteristic_by_handle(&self, handle: u16) -> Option<Characteristic> {
        self.state
            .read()
            .services
            .iter()
            .flat_map(|s| s.characteristics().iter())
            .find(|c| c.handle() == handle)
            .cloned()
    }

    pub fn add_listener(&self, listener: Arc<dyn DeviceListener>) -> Subscription {
        self.listeners.add(listener)
    }

    fn backend(&self) -> Result<Arc<dyn GattBackend>, BluetoothError> {
        self.backend.upgrade().ok_or(BluetoothError::AdapterGone)
    }

    /// Start connecting. `Ok(true)` means the transport accepted the request;
    /// the link is reported later through `on_connection_state_change`.
    pub async fn connect(&self) -> Result<bool, BluetoothError> {
        self.backend()?.connect(self).await
    }

    pub async fn disconnect(&self) -> Result<bool, BluetoothError> {
        self.backend()?.disconnect(self).await
    }

    /// Start enumerating services; completion is reported via `on_services_discovered`
    pub async fn discover_services(&self) -> Result<bool, BluetoothError> {
        self.backend()?.discover_services(self).await
    }

    /// Start reading a characteristic; the value arrives via `on_characteristic_read_complete`
    pub async fn read_characteristic(&self, characteristic: &Characteristic) -> Result<bool, BluetoothError> {
        self.backend()?.read_characteristic(self, characteristic).await
    }

    /// Write a characteristic value. The cached value is left untouched; only
    /// reads and notifications update it.
    pub async fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<bool, BluetoothError> {
        self.backend()?
            .write_characteristic(self, characteristic.handle(), value)
            .await
    }

    /// Subscribe to notifications by writing the characteristic's CCC descriptor
    pub async fn enable_notifications(&self, uuid: &Uuid) -> Result<bool, BluetoothError> {
        let ccc = self
            .characteristic(uuid)
            .and_then(|c| c.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID).cloned());
        match ccc {
            Some(descriptor) => {
                self.backend()?
                    .write_characteristic(self, descriptor.handle, &[0x01, 0x00])
                    .await
            }
            None => {
                debug!("{}: no CCC descriptor for {}", self.address, uuid);
                Ok(false)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Backend-facing mutators
    // ---------------------------------------------------------------------

    fn transition(&self, next: ConnectionState) -> bool {
        let changed = {
            let mut state = self.state.write();
            if state.connection_state == next {
                false
            } else {
                debug!(
                    "{}: {} -> {}",
                    self.address, state.connection_state, next
                );
                state.connection_state = next;
                true
            }
        };
        if changed {
            let notification = ConnectionStatusNotification {
                address: self.address,
                state: next,
            };
            self.listeners
                .notify("connection state change", |l| l.on_connection_state_change(&notification));
        }
        changed
    }

    /// Apply a scan sighting. Returns true on the device's first sighting.
    pub fn record_sighting(
        &self,
        address_type: AddressType,
        rssi: i8,
        bond_state: BondState,
        data: &[u8],
    ) -> bool {
        let advertisement = AdvertisementData::parse(data);
        let (first, promote) = {
            let mut state = self.state.write();
            let first = state.last_seen.is_none();
            state.last_seen = Some(SystemTime::now());
            state.rssi = Some(rssi);
            state.bond_state = bond_state;
            if address_type != AddressType::Unknown {
                state.address_type = address_type;
            }
            if let Some(name) = &advertisement.local_name {
                if advertisement.name_complete || state.name.is_none() {
                    state.name = Some(name.clone());
                }
            }
            if advertisement.tx_power.is_some() {
                state.tx_power = advertisement.tx_power;
            }
            if advertisement.manufacturer_id.is_some() {
                state.manufacturer_id = advertisement.manufacturer_id;
            }
            (first, state.connection_state == ConnectionState::Idle)
        };

        if promote {
            self.transition(ConnectionState::Discovered);
        }

        let notification = ScanNotification {
            address: self.address,
            rssi,
            advertisement,
            data: data.to_vec(),
        };
        self.listeners
            .notify("scan record", |l| l.on_scan_record_received(&notification));
        first
    }

    /// The transport accepted a connect request. Only advances from a
    /// disconnected state, so a link reported early is not rolled back.
    pub fn mark_connecting(&self) -> bool {
        let current = self.connection_state();
        match current {
            ConnectionState::Idle | ConnectionState::Discovered | ConnectionState::Disconnected => {
                self.transition(ConnectionState::Connecting)
            }
            _ => false,
        }
    }

    /// Link established on `handle`
    pub fn mark_connected(&self, handle: ConnectionHandle) -> bool {
        let already_up = {
            let mut state = self.state.write();
            state.connection_handle = Some(handle);
            state.connection_state.is_connected()
        };
        if already_up {
            false
        } else {
            self.transition(ConnectionState::Connected)
        }
    }

    /// Link lost. The service catalog is retained.
    pub fn mark_disconnected(&self) -> bool {
        self.state.write().connection_handle = None;
        self.transition(ConnectionState::Disconnected)
    }

    pub fn mark_service_discovery(&self) -> bool {
        self.transition(ConnectionState::ServiceDiscovery)
    }

    /// Service enumeration aborted; fall back to plain `Connected` if the link is up
    pub fn abort_service_discovery(&self) -> bool {
        if self.connection_state() == ConnectionState::ServiceDiscovery {
            self.transition(ConnectionState::Connected)
        } else {
            false
        }
    }

    /// Service enumeration finished
    pub fn mark_ready(&self) {
        self.transition(ConnectionState::Ready);
        self.listeners
            .notify("services discovered", |l| l.on_services_discovered());
    }

    /// Insert a service, replacing one already known at the same start handle
    pub fn add_service(&self, service: Service) {
        let mut state = self.state.write();
        match state
            .services
            .iter_mut()
            .find(|s| s.handle_start() == service.handle_start())
        {
            Some(existing) if existing.uuid() == service.uuid() => {}
            Some(existing) => *existing = service,
            None => state.services.push(service),
        }
    }

    /// Add a characteristic to the service whose handle range contains it
    pub fn add_characteristic(&self, characteristic: Characteristic) -> bool {
        let mut state = self.state.write();
        match state
            .services
            .iter_mut()
            .find(|s| s.contains_handle(characteristic.handle()))
        {
            Some(service) => {
                service.add_characteristic(characteristic);
                true
            }
            None => false,
        }
    }

    pub fn add_descriptor(&self, uuid: Uuid, handle: u16) -> bool {
        let mut state = self.state.write();
        match state.services.iter_mut().find(|s| s.contains_handle(handle)) {
            Some(service) => service.add_descriptor(Descriptor { uuid, handle }),
            None => false,
        }
    }

    /// Store a confirmed value and return the updated characteristic
    pub fn update_value(&self, handle: u16, value: &[u8]) -> Option<Characteristic> {
        let mut state = self.state.write();
        state
            .services
            .iter_mut()
            .find_map(|s| s.characteristic_by_handle_mut(handle))
            .map(|c| {
                c.set_value(value.to_vec());
                c.clone()
            })
    }

    /// Fire read completion for a characteristic
    pub fn notify_read_complete(&self, characteristic: &Characteristic, status: CompletionStatus) {
        self.listeners.notify("read complete", |l| {
            l.on_characteristic_read_complete(characteristic, status)
        });
    }

    pub fn notify_write_complete(&self, characteristic: &Characteristic, status: CompletionStatus) {
        self.listeners.notify("write complete", |l| {
            l.on_characteristic_write_complete(characteristic, status)
        });
    }

    pub fn notify_characteristic_update(&self, characteristic: &Characteristic) {
        self.listeners
            .notify("characteristic update", |l| l.on_characteristic_update(characteristic));
    }

    /// Write completions can target a descriptor; describe it as a characteristic
    pub fn attribute_for_handle(&self, handle: u16) -> Characteristic {
        if let Some(c) = self.characteristic_by_handle(handle) {
            return c;
        }
        let descriptor_uuid = self
            .state
            .read()
            .services
            .iter()
            .flat_map(|s| s.characteristics().iter())
            .flat_map(|c| c.descriptors().iter())
            .find(|d| d.handle == handle)
            .map(|d| d.uuid);
        Characteristic::new(descriptor_uuid.unwrap_or_else(|| uuid_from_u16(0)), handle)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("address_type", &state.address_type)
            .field("name", &state.name)
            .field("rssi", &state.rssi)
            .field("connection_state", &state.connection_state)
            .field("connection_handle", &state.connection_handle)
            .field("services", &state.services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct NoBackend;

    #[async_trait]
    impl GattBackend for NoBackend {
        async fn connect(&self, _device: &Device) -> Result<bool, BluetoothError> {
            Ok(false)
        }
        async fn disconnect(&self, _device: &Device) -> Result<bool, BluetoothError> {
            Ok(false)
        }
        async fn discover_services(&self, _device: &Device) -> Result<bool, BluetoothError> {
            Ok(false)
        }
        async fn read_characteristic(
            &self,
            _device: &Device,
            _characteristic: &Characteristic,
        ) -> Result<bool, BluetoothError> {
            Ok(false)
        }
        async fn write_characteristic(
            &self,
            _device: &Device,
            _handle: u16,
            _value: &[u8],
        ) -> Result<bool, BluetoothError> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct StateRecorder {
        states: Mutex<Vec<ConnectionState>>,
        scans: Mutex<usize>,
        discovered: Mutex<usize>,
    }

    impl DeviceListener for StateRecorder {
        fn on_scan_record_received(&self, _notification: &ScanNotification) {
            *self.scans.lock() += 1;
        }
        fn on_connection_state_change(&self, notification: &ConnectionStatusNotification) {
            self.states.lock().push(notification.state);
        }
        fn on_services_discovered(&self) {
            *self.discovered.lock() += 1;
        }
    }

    fn orphan_device() -> Device {
        let backend: Weak<dyn GattBackend> = Weak::<NoBackend>::new();
        Device::new(
            BluetoothAddress::new([1, 2, 3, 4, 5, 6]),
            AddressType::Unknown,
            backend,
        )
    }

    fn catalog_device() -> Device {
        let device = orphan_device();
        device.add_service(Service::new(uuid_from_u16(0x180F), true, 0x10, 0x1F));
        device.add_characteristic(Characteristic::new(uuid_from_u16(0x2A19), 0x12));
        device
    }

    #[test]
    fn test_initial_state() {
        let device = orphan_device();
        assert_eq!(device.connection_state(), ConnectionState::Idle);
        assert_eq!(device.address_type(), AddressType::Unknown);
        assert!(device.connection_handle().is_none());
        assert!(device.services().is_empty());
    }

    #[test]
    fn test_first_sighting_and_repeat() {
        let device = orphan_device();
        let recorder = Arc::new(StateRecorder::default());
        let _sub = device.add_listener(recorder.clone());

        let data = [0x05, 0x09, b'B', b'u', b'l', b'b'];
        assert!(device.record_sighting(AddressType::Public, -60, BondState::NotBonded, &data));
        assert!(!device.record_sighting(AddressType::Public, -55, BondState::NotBonded, &data));

        assert_eq!(device.connection_state(), ConnectionState::Discovered);
        assert_eq!(device.address_type(), AddressType::Public);
        assert_eq!(device.name().as_deref(), Some("Bulb"));
        assert_eq!(device.rssi(), Some(-55));
        assert_eq!(*recorder.scans.lock(), 2);
        assert_eq!(*recorder.states.lock(), vec![ConnectionState::Discovered]);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let device = catalog_device();
        let recorder = Arc::new(StateRecorder::default());
        let _sub = device.add_listener(recorder.clone());

        assert!(device.mark_connecting());
        assert!(device.mark_connected(3));
        assert_eq!(device.connection_handle(), Some(3));
        assert!(device.mark_service_discovery());
        device.mark_ready();
        assert!(device.mark_disconnected());

        assert_eq!(
            *recorder.states.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::ServiceDiscovery,
                ConnectionState::Ready,
                ConnectionState::Disconnected,
            ]
        );
        assert_eq!(*recorder.discovered.lock(), 1);
        assert!(device.connection_handle().is_none());
        // Catalog survives a transient disconnect
        assert_eq!(device.services().len(), 1);
        assert!(device.characteristic(&uuid_from_u16(0x2A19)).is_some());
    }

    #[test]
    fn test_connecting_does_not_roll_back_link() {
        let device = orphan_device();
        device.mark_connected(1);
        assert!(!device.mark_connecting());
        assert_eq!(device.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_parameter_update_does_not_renotify() {
        let device = orphan_device();
        assert!(device.mark_connected(1));
        assert!(!device.mark_connected(1));
    }

    #[test]
    fn test_update_value_by_handle() {
        let device = catalog_device();
        let updated = device.update_value(0x12, &[0x64]).unwrap();
        assert_eq!(updated.value(), &[0x64]);
        assert_eq!(device.characteristic_by_handle(0x12).unwrap().value(), &[0x64]);
        assert!(device.update_value(0x40, &[0x01]).is_none());
    }

    #[test]
    fn test_characteristic_outside_services_is_dropped() {
        let device = catalog_device();
        assert!(!device.add_characteristic(Characteristic::new(uuid_from_u16(0x2A00), 0x40)));
    }

    #[test]
    fn test_attribute_for_descriptor_handle() {
        let device = catalog_device();
        assert!(device.add_descriptor(uuid_from_u16(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID), 0x13));
        let attribute = device.attribute_for_handle(0x13);
        assert_eq!(
            attribute.uuid(),
            uuid_from_u16(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID)
        );
    }

    #[tokio::test]
    async fn test_operations_fail_without_backend() {
        let device = orphan_device();
        assert!(matches!(
            device.connect().await,
            Err(BluetoothError::AdapterGone)
        ));
    }

    #[tokio::test]
    async fn test_enable_notifications_without_ccc() {
        let backend: Arc<dyn GattBackend> = Arc::new(NoBackend);
        let device = Device::new(
            BluetoothAddress::new([1, 2, 3, 4, 5, 6]),
            AddressType::Public,
            Arc::downgrade(&backend),
        );
        device.add_service(Service::new(uuid_from_u16(0x180F), true, 0x10, 0x1F));
        device.add_characteristic(Characteristic::new(uuid_from_u16(0x2A19), 0x12));
        assert!(!device
            .enable_notifications(&uuid_from_u16(0x2A19))
            .await
            .unwrap());
    }
}
