// Blegate core: Bluetooth adapter abstraction and the BlueGiga BGAPI backend.
//
// Consumers work with `BluetoothAdapter`, `Device` and the listener traits;
// backends drive devices through the `GattBackend` seam.

pub mod adapter;
pub mod address;
pub mod advertisement;
pub mod bluegiga;
pub mod config;
pub mod device;
pub mod error;
pub mod gatt;
pub mod listener;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use adapter::{AdapterStatus, BluetoothAdapter, DiscoveryListener, OfflineReason, ScanMode};
pub use address::{AddressError, AddressType, BluetoothAddress};
pub use advertisement::AdvertisementData;
pub use bluegiga::{AdapterInfo, BlueGigaAdapter};
pub use config::{AdapterConfig, ConfigError, ConnectionParameters, ScanParameters};
pub use device::{
    BondState, ConnectionHandle, ConnectionState, ConnectionStatusNotification, Device,
    DeviceListener, GattBackend, ScanNotification,
};
pub use error::BluetoothError;
pub use gatt::{
    uuid_from_u16, uuid_to_u16, Characteristic, CharacteristicProperties, CompletionStatus,
    Descriptor, Service,
};
pub use listener::{ListenerSet, Subscription};
