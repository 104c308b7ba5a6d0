//! Typed BGAPI commands

use super::frame::{Frame, FrameError, MessageKind, PayloadWriter};
use super::types::{BgAddressType, GapConnectableMode, GapDiscoverMode, GapDiscoverableMode};
use crate::address::BluetoothAddress;
use crate::device::ConnectionHandle;

pub const CLASS_SYSTEM: u8 = 0x00;
pub const CLASS_CONNECTION: u8 = 0x03;
pub const CLASS_ATTCLIENT: u8 = 0x04;
pub const CLASS_GAP: u8 = 0x06;

/// Commands the host sends to the dongle. Each is answered by exactly one
/// response with the same class and command id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BgCommand {
    SystemHello,
    SystemAddressGet,
    SystemGetConnections,
    SystemGetInfo,
    ConnectionDisconnect {
        connection: ConnectionHandle,
    },
    ConnectionGetRssi {
        connection: ConnectionHandle,
    },
    /// Enumerate attribute groups of `group_type` (e.g. primary services)
    AttClientReadByGroupType {
        connection: ConnectionHandle,
        start: u16,
        end: u16,
        group_type: Vec<u8>,
    },
    /// Enumerate every attribute handle and type in a range
    AttClientFindInformation {
        connection: ConnectionHandle,
        start: u16,
        end: u16,
    },
    AttClientReadByHandle {
        connection: ConnectionHandle,
        handle: u16,
    },
    AttClientAttributeWrite {
        connection: ConnectionHandle,
        handle: u16,
        data: Vec<u8>,
    },
    GapSetMode {
        discover: GapDiscoverableMode,
        connect: GapConnectableMode,
    },
    GapDiscover {
        mode: GapDiscoverMode,
    },
    GapConnectDirect {
        address: BluetoothAddress,
        address_type: BgAddressType,
        conn_interval_min: u16,
        conn_interval_max: u16,
        timeout: u16,
        latency: u16,
    },
    GapEndProcedure,
    GapSetScanParameters {
        scan_interval: u16,
        scan_window: u16,
        active: bool,
    },
}

impl BgCommand {
    /// `(class, command)` identifying the command and its response
    pub fn id(&self) -> (u8, u8) {
        match self {
            BgCommand::SystemHello => (CLASS_SYSTEM, 0x01),
            BgCommand::SystemAddressGet => (CLASS_SYSTEM, 0x02),
            BgCommand::SystemGetConnections => (CLASS_SYSTEM, 0x06),
            BgCommand::SystemGetInfo => (CLASS_SYSTEM, 0x08),
            BgCommand::ConnectionDisconnect { .. } => (CLASS_CONNECTION, 0x00),
            BgCommand::ConnectionGetRssi { .. } => (CLASS_CONNECTION, 0x01),
            BgCommand::AttClientReadByGroupType { .. } => (CLASS_ATTCLIENT, 0x01),
            BgCommand::AttClientFindInformation { .. } => (CLASS_ATTCLIENT, 0x03),
            BgCommand::AttClientReadByHandle { .. } => (CLASS_ATTCLIENT, 0x04),
            BgCommand::AttClientAttributeWrite { .. } => (CLASS_ATTCLIENT, 0x05),
            BgCommand::GapSetMode { .. } => (CLASS_GAP, 0x01),
            BgCommand::GapDiscover { .. } => (CLASS_GAP, 0x02),
            BgCommand::GapConnectDirect { .. } => (CLASS_GAP, 0x03),
            BgCommand::GapEndProcedure => (CLASS_GAP, 0x04),
            BgCommand::GapSetScanParameters { .. } => (CLASS_GAP, 0x07),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BgCommand::SystemHello => "system_hello",
            BgCommand::SystemAddressGet => "system_address_get",
            BgCommand::SystemGetConnections => "system_get_connections",
            BgCommand::SystemGetInfo => "system_get_info",
            BgCommand::ConnectionDisconnect { .. } => "connection_disconnect",
            BgCommand::ConnectionGetRssi { .. } => "connection_get_rssi",
            BgCommand::AttClientReadByGroupType { .. } => "attclient_read_by_group_type",
            BgCommand::AttClientFindInformation { .. } => "attclient_find_information",
            BgCommand::AttClientReadByHandle { .. } => "attclient_read_by_handle",
            BgCommand::AttClientAttributeWrite { .. } => "attclient_attribute_write",
            BgCommand::GapSetMode { .. } => "gap_set_mode",
            BgCommand::GapDiscover { .. } => "gap_discover",
            BgCommand::GapConnectDirect { .. } => "gap_connect_direct",
            BgCommand::GapEndProcedure => "gap_end_procedure",
            BgCommand::GapSetScanParameters { .. } => "gap_set_scan_parameters",
        }
    }

    fn payload(&self) -> Vec<u8> {
        let w = PayloadWriter::new();
        match self {
            BgCommand::SystemHello
            | BgCommand::SystemAddressGet
            | BgCommand::SystemGetConnections
            | BgCommand::SystemGetInfo
            | BgCommand::GapEndProcedure => w.finish(),
            BgCommand::ConnectionDisconnect { connection }
            | BgCommand::ConnectionGetRssi { connection } => w.u8(*connection).finish(),
            BgCommand::AttClientReadByGroupType {
                connection,
                start,
                end,
                group_type,
            } => w.u8(*connection).u16(*start).u16(*end).array(group_type).finish(),
            BgCommand::AttClientFindInformation {
                connection,
                start,
                end,
            } => w.u8(*connection).u16(*start).u16(*end).finish(),
            BgCommand::AttClientReadByHandle { connection, handle } => {
                w.u8(*connection).u16(*handle).finish()
            }
            BgCommand::AttClientAttributeWrite {
                connection,
                handle,
                data,
            } => w.u8(*connection).u16(*handle).array(data).finish(),
            BgCommand::GapSetMode { discover, connect } => {
                w.u8(*discover as u8).u8(*connect as u8).finish()
            }
            BgCommand::GapDiscover { mode } => w.u8(*mode as u8).finish(),
            BgCommand::GapConnectDirect {
                address,
                address_type,
                conn_interval_min,
                conn_interval_max,
                timeout,
                latency,
            } => w
                .address(address.to_le_bytes())
                .u8(address_type.to_u8())
                .u16(*conn_interval_min)
                .u16(*conn_interval_max)
                .u16(*timeout)
                .u16(*latency)
                .finish(),
            BgCommand::GapSetScanParameters {
                scan_interval,
                scan_window,
                active,
            } => w
                .u16(*scan_interval)
                .u16(*scan_window)
                .u8(u8::from(*active))
                .finish(),
        }
    }

    pub fn to_frame(&self) -> Frame {
        let (class_id, command_id) = self.id();
        Frame::new(MessageKind::Response, class_id, command_id, self.payload())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        self.to_frame().to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_scan_parameters_encoding() {
        let command = BgCommand::GapSetScanParameters {
            scan_interval: 0x40,
            scan_window: 0x08,
            active: false,
        };
        assert_eq!(
            command.to_bytes().unwrap(),
            vec![0x00, 0x05, 0x06, 0x07, 0x40, 0x00, 0x08, 0x00, 0x00]
        );
    }

    #[test]
    fn test_connect_direct_encodes_address_little_endian() {
        let command = BgCommand::GapConnectDirect {
            address: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            address_type: BgAddressType::Random,
            conn_interval_min: 60,
            conn_interval_max: 100,
            timeout: 100,
            latency: 0,
        };
        let bytes = command.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0x00, 15, 0x06, 0x03]);
        assert_eq!(&bytes[4..10], &[0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(bytes[10], 1);
        assert_eq!(&bytes[11..13], &60u16.to_le_bytes());
    }

    #[test]
    fn test_attribute_write_encoding() {
        let command = BgCommand::AttClientAttributeWrite {
            connection: 2,
            handle: 0x0020,
            data: vec![0x01],
        };
        assert_eq!(
            command.to_bytes().unwrap(),
            vec![0x00, 0x05, 0x04, 0x05, 0x02, 0x20, 0x00, 0x01, 0x01]
        );
    }

    #[test]
    fn test_read_by_group_type_primary_service() {
        let command = BgCommand::AttClientReadByGroupType {
            connection: 0,
            start: 1,
            end: 0xFFFF,
            group_type: vec![0x00, 0x28],
        };
        assert_eq!(
            command.to_bytes().unwrap(),
            vec![0x00, 0x08, 0x04, 0x01, 0x00, 0x01, 0x00, 0xFF, 0xFF, 0x02, 0x00, 0x28]
        );
    }

    #[test]
    fn test_empty_payload_commands() {
        assert_eq!(
            BgCommand::GapEndProcedure.to_bytes().unwrap(),
            vec![0x00, 0x00, 0x06, 0x04]
        );
        assert_eq!(
            BgCommand::SystemGetConnections.to_bytes().unwrap(),
            vec![0x00, 0x00, 0x00, 0x06]
        );
    }
}
