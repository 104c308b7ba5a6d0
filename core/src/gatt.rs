//! GATT data model: services, characteristics and descriptors.
//!
//! Services and characteristics are plain values owned by their [`Device`](crate::Device);
//! listeners and callers receive clones, so a snapshot never changes under them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bluetooth base UUID low bits (`0000xxxx-0000-1000-8000-00805f9b34fb`)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Primary service declaration attribute type
pub const PRIMARY_SERVICE_UUID: u16 = 0x2800;
/// Secondary service declaration attribute type
pub const SECONDARY_SERVICE_UUID: u16 = 0x2801;
/// Include declaration attribute type
pub const INCLUDE_UUID: u16 = 0x2802;
/// Characteristic declaration attribute type
pub const CHARACTERISTIC_DECLARATION_UUID: u16 = 0x2803;
/// Client Characteristic Configuration descriptor
pub const CLIENT_CHARACTERISTIC_CONFIGURATION_UUID: u16 = 0x2902;

/// Expand a 16-bit SIG-assigned UUID onto the Bluetooth base UUID
pub fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expand a 32-bit SIG-assigned UUID onto the Bluetooth base UUID
pub fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Return the 16-bit alias of a UUID if it sits on the Bluetooth base UUID
pub fn uuid_to_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask: u128 = (1u128 << 96) - 1;
    if value & mask == BLUETOOTH_BASE_UUID && value >> 112 == 0 {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Decode a UUID transmitted little-endian in 2, 4 or 16 bytes
pub fn uuid_from_le_bytes(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        2 => Some(uuid_from_u16(u16::from_le_bytes([bytes[0], bytes[1]]))),
        4 => Some(uuid_from_u32(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        16 => {
            let mut be = [0u8; 16];
            for (i, b) in bytes.iter().rev().enumerate() {
                be[i] = *b;
            }
            Some(Uuid::from_bytes(be))
        }
        _ => None,
    }
}

/// Encode a UUID little-endian, using the 2-byte form when it has a 16-bit alias
pub fn uuid_to_le_bytes(uuid: &Uuid) -> Vec<u8> {
    match uuid_to_u16(uuid) {
        Some(short) => short.to_le_bytes().to_vec(),
        None => uuid.as_bytes().iter().rev().copied().collect(),
    }
}

/// Characteristic property bitmask as declared by the peripheral
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
    pub const AUTHENTICATED_SIGNED_WRITES: u8 = 0x40;
    pub const EXTENDED_PROPERTIES: u8 = 0x80;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.0 & (Self::WRITE | Self::WRITE_WITHOUT_RESPONSE) != 0
    }

    pub fn can_notify(&self) -> bool {
        self.0 & (Self::NOTIFY | Self::INDICATE) != 0
    }
}

impl fmt::Debug for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CharacteristicProperties({:#04x})", self.0)
    }
}

/// Outcome of an asynchronous characteristic read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Success,
    Error,
}

/// A descriptor attached to a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub handle: u16,
}

/// A GATT characteristic and its most recently confirmed value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    uuid: Uuid,
    handle: u16,
    properties: CharacteristicProperties,
    value: Vec<u8>,
    descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// Create a characteristic with no known properties and an empty value
    pub fn new(uuid: Uuid, handle: u16) -> Self {
        Self {
            uuid,
            handle,
            properties: CharacteristicProperties::default(),
            value: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn with_properties(mut self, properties: CharacteristicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Attribute handle of the characteristic value
    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// Latest confirmed value (read completion or notification)
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Find a descriptor by its 16-bit type
    pub fn descriptor(&self, short_uuid: u16) -> Option<&Descriptor> {
        let uuid = uuid_from_u16(short_uuid);
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }

    pub(crate) fn set_value(&mut self, value: Vec<u8>) {
        self.value = value;
    }

    pub(crate) fn add_descriptor(&mut self, descriptor: Descriptor) {
        if !self.descriptors.iter().any(|d| d.handle == descriptor.handle) {
            self.descriptors.push(descriptor);
        }
    }
}

/// A GATT service covering a contiguous attribute handle range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    uuid: Uuid,
    primary: bool,
    handle_start: u16,
    handle_end: u16,
    characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid, primary: bool, handle_start: u16, handle_end: u16) -> Self {
        Self {
            uuid,
            primary,
            handle_start,
            handle_end,
            characteristics: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn handle_start(&self) -> u16 {
        self.handle_start
    }

    pub fn handle_end(&self) -> u16 {
        self.handle_end
    }

    /// Characteristics in discovery order
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }

    /// True if `handle` lies inside this service's handle range
    pub fn contains_handle(&self, handle: u16) -> bool {
        handle >= self.handle_start && handle <= self.handle_end
    }

    pub(crate) fn characteristic_by_handle_mut(&mut self, handle: u16) -> Option<&mut Characteristic> {
        self.characteristics.iter_mut().find(|c| c.handle == handle)
    }

    /// Insert a characteristic, replacing one already known at the same handle
    pub(crate) fn add_characteristic(&mut self, characteristic: Characteristic) {
        match self
            .characteristics
            .iter_mut()
            .find(|c| c.handle == characteristic.handle)
        {
            Some(existing) => {
                existing.uuid = characteristic.uuid;
                existing.properties = characteristic.properties;
            }
            None => self.characteristics.push(characteristic),
        }
    }

    /// Attach a descriptor to the closest characteristic declared before it
    pub(crate) fn add_descriptor(&mut self, descriptor: Descriptor) -> bool {
        let owner = self
            .characteristics
            .iter_mut()
            .filter(|c| c.handle < descriptor.handle)
            .max_by_key(|c| c.handle);
        match owner {
            Some(characteristic) => {
                characteristic.add_descriptor(descriptor);
                true
            }
            None => false,
        }
    }
}
