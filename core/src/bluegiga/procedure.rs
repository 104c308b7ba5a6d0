//! Per-device GATT procedure tracking.
//!
//! The attribute client can run one procedure per connection. Completion events
//! carry no procedure id, so the adapter records what each device is doing and
//! interprets `procedure_completed` / `attribute_value` against it.

use crate::address::BluetoothAddress;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// GATT procedure currently running for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GattProcedure {
    #[default]
    Idle,
    /// Enumerating primary services
    GetServices,
    /// Enumerating attribute handles after services are known
    GetCharacteristics,
    Read(u16),
    Write(u16),
}

impl fmt::Display for GattProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattProcedure::Idle => write!(f, "idle"),
            GattProcedure::GetServices => write!(f, "get services"),
            GattProcedure::GetCharacteristics => write!(f, "get characteristics"),
            GattProcedure::Read(handle) => write!(f, "read {:#06x}", handle),
            GattProcedure::Write(handle) => write!(f, "write {:#06x}", handle),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ProcedureTable {
    inner: Mutex<HashMap<BluetoothAddress, GattProcedure>>,
}

impl ProcedureTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, address: &BluetoothAddress) -> GattProcedure {
        self.inner.lock().get(address).copied().unwrap_or_default()
    }

    /// Claim the device for `procedure`. Fails if another procedure is running.
    pub(crate) fn begin(&self, address: BluetoothAddress, procedure: GattProcedure) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.entry(address).or_default();
        if *current != GattProcedure::Idle {
            return false;
        }
        *current = procedure;
        true
    }

    /// Move a running procedure to its next stage
    pub(crate) fn advance(&self, address: BluetoothAddress, procedure: GattProcedure) {
        self.inner.lock().insert(address, procedure);
    }

    /// Return the device to idle, yielding the procedure that was running
    pub(crate) fn finish(&self, address: &BluetoothAddress) -> GattProcedure {
        self.inner.lock().remove(address).unwrap_or_default()
    }
}
