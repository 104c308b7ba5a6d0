//! Bluetooth device addresses

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors for address parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address length: expected 6 octets, got {0}")]
    InvalidLength(usize),
    #[error("Invalid hex octet: {0}")]
    InvalidHex(String),
}

/// 6-byte Bluetooth hardware address.
///
/// Bytes are stored most-significant first, i.e. in the order they are written
/// in the canonical `aa:bb:cc:dd:ee:ff` form. Equality and hashing use the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BluetoothAddress([u8; 6]);

impl BluetoothAddress {
    /// Number of octets in an address
    pub const LENGTH: usize = 6;

    /// Create an address from bytes in display order
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Create an address from the little-endian wire order used by controllers
    pub fn from_le_bytes(bytes: [u8; 6]) -> Self {
        let mut octets = bytes;
        octets.reverse();
        Self(octets)
    }

    /// Bytes in little-endian wire order
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut octets = self.0;
        octets.reverse();
        octets
    }

    /// Bytes in display order
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BluetoothAddress({})", self)
    }
}

impl FromStr for BluetoothAddress {
    type Err = AddressError;

    /// Accepts `:` or `-` separated octets, or 12 bare hex digits, in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let octets: Vec<&str> = if trimmed.contains(':') || trimmed.contains('-') {
            trimmed.split(|c| c == ':' || c == '-').collect()
        } else {
            if trimmed.len() != 12 || !trimmed.is_ascii() {
                return Err(AddressError::InvalidLength(trimmed.len() / 2));
            }
            (0..6).map(|i| &trimmed[i * 2..i * 2 + 2]).collect()
        };

        if octets.len() != Self::LENGTH {
            return Err(AddressError::InvalidLength(octets.len()));
        }

        let mut bytes = [0u8; 6];
        for (slot, octet) in bytes.iter_mut().zip(octets) {
            if octet.len() != 2 {
                return Err(AddressError::InvalidHex(octet.to_string()));
            }
            *slot = u8::from_str_radix(octet, 16)
                .map_err(|_| AddressError::InvalidHex(octet.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl From<[u8; 6]> for BluetoothAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self::new(bytes)
    }
}

/// Kind of address a peripheral advertises with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    /// IEEE-assigned public address
    Public,
    /// Random (static or private) address
    Random,
    /// Not yet known, e.g. a device created before it was ever seen
    Unknown,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Public => write!(f, "public"),
            AddressType::Random => write!(f, "random"),
            AddressType::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_display_is_lowercase_colon_separated() {
        let address = BluetoothAddress::new([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(address.to_string(), "aa:bb:cc:01:02:03");
    }

    #[test]
    fn test_parse_separators_and_case() {
        let expected = BluetoothAddress::new([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!("AA:BB:CC:01:02:03".parse::<BluetoothAddress>(), Ok(expected));
        assert_eq!("aa-bb-cc-01-02-03".parse::<BluetoothAddress>(), Ok(expected));
        assert_eq!("aabbcc010203".parse::<BluetoothAddress>(), Ok(expected));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            "aa:bb:cc".parse::<BluetoothAddress>(),
            Err(AddressError::InvalidLength(3))
        );
        assert!(matches!(
            "zz:bb:cc:01:02:03".parse::<BluetoothAddress>(),
            Err(AddressError::InvalidHex(_))
        ));
        assert!(matches!(
            "a:bb:cc:01:02:033".parse::<BluetoothAddress>(),
            Err(AddressError::InvalidHex(_))
        ));
        assert!("".parse::<BluetoothAddress>().is_err());
    }

    #[test]
    fn test_wire_order_is_reversed() {
        let address = BluetoothAddress::from_le_bytes([0x03, 0x02, 0x01, 0xCC, 0xBB, 0xAA]);
        assert_eq!(address.to_string(), "aa:bb:cc:01:02:03");
        assert_eq!(address.to_le_bytes(), [0x03, 0x02, 0x01, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_hash_equality_by_bytes() {
        let mut set = HashSet::new();
        set.insert("aa:bb:cc:01:02:03".parse::<BluetoothAddress>().unwrap());
        set.insert("AA-BB-CC-01-02-03".parse::<BluetoothAddress>().unwrap());
        assert_eq!(set.len(), 1);
    }
}
