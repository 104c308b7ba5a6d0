//! Typed BGAPI responses and events

use super::command::{CLASS_ATTCLIENT, CLASS_CONNECTION, CLASS_GAP, CLASS_SYSTEM};
use super::frame::{Frame, FrameError, MessageKind, PayloadReader, PayloadWriter};
use super::types::{
    AttributeValueType, BgAddressType, BgApiResponse, ConnectionStatusFlags, ScanResponseType,
};
use crate::address::BluetoothAddress;
use crate::device::ConnectionHandle;
use crate::gatt::{uuid_from_le_bytes, uuid_to_le_bytes};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Firmware identification returned by `system_get_info` and the boot event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub build: u16,
    pub ll_version: u16,
    pub protocol_version: u8,
    pub hardware: u8,
}

impl FirmwareInfo {
    /// `major.minor.patch.build`
    pub fn version(&self) -> String {
        format!("{}.{}.{}.{}", self.major, self.minor, self.patch, self.build)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            major: r.read_u16()?,
            minor: r.read_u16()?,
            patch: r.read_u16()?,
            build: r.read_u16()?,
            ll_version: r.read_u16()?,
            protocol_version: r.read_u8()?,
            hardware: r.read_u8()?,
        })
    }

    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.u16(self.major)
            .u16(self.minor)
            .u16(self.patch)
            .u16(self.build)
            .u16(self.ll_version)
            .u8(self.protocol_version)
            .u8(self.hardware)
    }
}

/// Responses, one per [`BgCommand`](super::command::BgCommand)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BgResponse {
    SystemHello,
    SystemAddressGet {
        address: BluetoothAddress,
    },
    SystemGetConnections {
        max_connections: u8,
    },
    SystemGetInfo(FirmwareInfo),
    ConnectionDisconnect {
        connection: ConnectionHandle,
        result: BgApiResponse,
    },
    ConnectionGetRssi {
        connection: ConnectionHandle,
        rssi: i8,
    },
    AttClientReadByGroupType {
        connection: ConnectionHandle,
        result: BgApiResponse,
    },
    AttClientFindInformation {
        connection: ConnectionHandle,
        result: BgApiResponse,
    },
    AttClientReadByHandle {
        connection: ConnectionHandle,
        result: BgApiResponse,
    },
    AttClientAttributeWrite {
        connection: ConnectionHandle,
        result: BgApiResponse,
    },
    GapSetMode {
        result: BgApiResponse,
    },
    GapDiscover {
        result: BgApiResponse,
    },
    GapConnectDirect {
        result: BgApiResponse,
        connection: ConnectionHandle,
    },
    GapEndProcedure {
        result: BgApiResponse,
    },
    GapSetScanParameters {
        result: BgApiResponse,
    },
}

impl BgResponse {
    pub fn id(&self) -> (u8, u8) {
        match self {
            BgResponse::SystemHello => (CLASS_SYSTEM, 0x01),
            BgResponse::SystemAddressGet { .. } => (CLASS_SYSTEM, 0x02),
            BgResponse::SystemGetConnections { .. } => (CLASS_SYSTEM, 0x06),
            BgResponse::SystemGetInfo(_) => (CLASS_SYSTEM, 0x08),
            BgResponse::ConnectionDisconnect { .. } => (CLASS_CONNECTION, 0x00),
            BgResponse::ConnectionGetRssi { .. } => (CLASS_CONNECTION, 0x01),
            BgResponse::AttClientReadByGroupType { .. } => (CLASS_ATTCLIENT, 0x01),
            BgResponse::AttClientFindInformation { .. } => (CLASS_ATTCLIENT, 0x03),
            BgResponse::AttClientReadByHandle { .. } => (CLASS_ATTCLIENT, 0x04),
            BgResponse::AttClientAttributeWrite { .. } => (CLASS_ATTCLIENT, 0x05),
            BgResponse::GapSetMode { .. } => (CLASS_GAP, 0x01),
            BgResponse::GapDiscover { .. } => (CLASS_GAP, 0x02),
            BgResponse::GapConnectDirect { .. } => (CLASS_GAP, 0x03),
            BgResponse::GapEndProcedure { .. } => (CLASS_GAP, 0x04),
            BgResponse::GapSetScanParameters { .. } => (CLASS_GAP, 0x07),
        }
    }

    /// Result code, for responses that carry one
    pub fn result(&self) -> Option<BgApiResponse> {
        match self {
            BgResponse::ConnectionDisconnect { result, .. }
            | BgResponse::AttClientReadByGroupType { result, .. }
            | BgResponse::AttClientFindInformation { result, .. }
            | BgResponse::AttClientReadByHandle { result, .. }
            | BgResponse::AttClientAttributeWrite { result, .. }
            | BgResponse::GapSetMode { result }
            | BgResponse::GapDiscover { result }
            | BgResponse::GapConnectDirect { result, .. }
            | BgResponse::GapEndProcedure { result }
            | BgResponse::GapSetScanParameters { result } => Some(*result),
            _ => None,
        }
    }

    /// True when the response carries a success code
    pub fn is_success(&self) -> bool {
        self.result().map(|r| r.is_success()).unwrap_or(false)
    }

    pub fn decode(class_id: u8, command_id: u8, payload: &[u8]) -> Result<Self, FrameError> {
        let mut r = PayloadReader::new(payload);
        let result = |r: &mut PayloadReader<'_>| r.read_u16().map(BgApiResponse::from_code);

        let response = match (class_id, command_id) {
            (CLASS_SYSTEM, 0x01) => BgResponse::SystemHello,
            (CLASS_SYSTEM, 0x02) => BgResponse::SystemAddressGet {
                address: BluetoothAddress::from_le_bytes(r.read_address()?),
            },
            (CLASS_SYSTEM, 0x06) => BgResponse::SystemGetConnections {
                max_connections: r.read_u8()?,
            },
            (CLASS_SYSTEM, 0x08) => BgResponse::SystemGetInfo(FirmwareInfo::decode(&mut r)?),
            (CLASS_CONNECTION, 0x00) => BgResponse::ConnectionDisconnect {
                connection: r.read_u8()?,
                result: result(&mut r)?,
            },
            (CLASS_CONNECTION, 0x01) => BgResponse::ConnectionGetRssi {
                connection: r.read_u8()?,
                rssi: r.read_i8()?,
            },
            (CLASS_ATTCLIENT, 0x01) => BgResponse::AttClientReadByGroupType {
                connection: r.read_u8()?,
                result: result(&mut r)?,
            },
            (CLASS_ATTCLIENT, 0x03) => BgResponse::AttClientFindInformation {
                connection: r.read_u8()?,
                result: result(&mut r)?,
            },
            (CLASS_ATTCLIENT, 0x04) => BgResponse::AttClientReadByHandle {
                connection: r.read_u8()?,
                result: result(&mut r)?,
            },
            (CLASS_ATTCLIENT, 0x05) => BgResponse::AttClientAttributeWrite {
                connection: r.read_u8()?,
                result: result(&mut r)?,
            },
            (CLASS_GAP, 0x01) => BgResponse::GapSetMode {
                result: result(&mut r)?,
            },
            (CLASS_GAP, 0x02) => BgResponse::GapDiscover {
                result: result(&mut r)?,
            },
            (CLASS_GAP, 0x03) => BgResponse::GapConnectDirect {
                result: result(&mut r)?,
                connection: r.read_u8()?,
            },
            (CLASS_GAP, 0x04) => BgResponse::GapEndProcedure {
                result: result(&mut r)?,
            },
            (CLASS_GAP, 0x07) => BgResponse::GapSetScanParameters {
                result: result(&mut r)?,
            },
            (class, command) => {
                return Err(FrameError::UnknownMessage {
                    kind: MessageKind::Response,
                    class,
                    command,
                })
            }
        };
        Ok(response)
    }

    /// Encode as the dongle would send it
    pub fn to_frame(&self) -> Frame {
        let w = PayloadWriter::new();
        let payload = match self {
            BgResponse::SystemHello => w.finish(),
            BgResponse::SystemAddressGet { address } => w.address(address.to_le_bytes()).finish(),
            BgResponse::SystemGetConnections { max_connections } => w.u8(*max_connections).finish(),
            BgResponse::SystemGetInfo(info) => info.encode(w).finish(),
            BgResponse::ConnectionDisconnect { connection, result }
            | BgResponse::AttClientReadByGroupType { connection, result }
            | BgResponse::AttClientFindInformation { connection, result }
            | BgResponse::AttClientReadByHandle { connection, result }
            | BgResponse::AttClientAttributeWrite { connection, result } => {
                w.u8(*connection).u16(result.code()).finish()
            }
            BgResponse::ConnectionGetRssi { connection, rssi } => {
                w.u8(*connection).i8(*rssi).finish()
            }
            BgResponse::GapSetMode { result }
            | BgResponse::GapDiscover { result }
            | BgResponse::GapEndProcedure { result }
            | BgResponse::GapSetScanParameters { result } => w.u16(result.code()).finish(),
            BgResponse::GapConnectDirect { result, connection } => {
                w.u16(result.code()).u8(*connection).finish()
            }
        };
        let (class_id, command_id) = self.id();
        Frame::new(MessageKind::Response, class_id, command_id, payload)
    }
}

/// Unsolicited events raised by the dongle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BgEvent {
    SystemBoot(FirmwareInfo),
    ConnectionStatus {
        connection: ConnectionHandle,
        flags: ConnectionStatusFlags,
        address: BluetoothAddress,
        address_type: BgAddressType,
        conn_interval: u16,
        timeout: u16,
        latency: u16,
        bonding: u8,
    },
    ConnectionDisconnected {
        connection: ConnectionHandle,
        reason: BgApiResponse,
    },
    AttClientProcedureCompleted {
        connection: ConnectionHandle,
        result: BgApiResponse,
        handle: u16,
    },
    AttClientGroupFound {
        connection: ConnectionHandle,
        start: u16,
        end: u16,
        uuid: Uuid,
    },
    AttClientFindInformationFound {
        connection: ConnectionHandle,
        handle: u16,
        uuid: Uuid,
    },
    AttClientAttributeValue {
        connection: ConnectionHandle,
        handle: u16,
        value_type: AttributeValueType,
        value: Vec<u8>,
    },
    GapScanResponse {
        rssi: i8,
        packet_type: ScanResponseType,
        sender: BluetoothAddress,
        address_type: BgAddressType,
        bond: u8,
        data: Vec<u8>,
    },
}

impl BgEvent {
    pub fn id(&self) -> (u8, u8) {
        match self {
            BgEvent::SystemBoot(_) => (CLASS_SYSTEM, 0x00),
            BgEvent::ConnectionStatus { .. } => (CLASS_CONNECTION, 0x00),
            BgEvent::ConnectionDisconnected { .. } => (CLASS_CONNECTION, 0x04),
            BgEvent::AttClientProcedureCompleted { .. } => (CLASS_ATTCLIENT, 0x01),
            BgEvent::AttClientGroupFound { .. } => (CLASS_ATTCLIENT, 0x02),
            BgEvent::AttClientFindInformationFound { .. } => (CLASS_ATTCLIENT, 0x04),
            BgEvent::AttClientAttributeValue { .. } => (CLASS_ATTCLIENT, 0x05),
            BgEvent::GapScanResponse { .. } => (CLASS_GAP, 0x00),
        }
    }

    /// Connection the event refers to, if any
    pub fn connection(&self) -> Option<ConnectionHandle> {
        match self {
            BgEvent::ConnectionStatus { connection, .. }
            | BgEvent::ConnectionDisconnected { connection, .. }
            | BgEvent::AttClientProcedureCompleted { connection, .. }
            | BgEvent::AttClientGroupFound { connection, .. }
            | BgEvent::AttClientFindInformationFound { connection, .. }
            | BgEvent::AttClientAttributeValue { connection, .. } => Some(*connection),
            _ => None,
        }
    }

    pub fn decode(class_id: u8, command_id: u8, payload: &[u8]) -> Result<Self, FrameError> {
        let mut r = PayloadReader::new(payload);
        let uuid = |bytes: Vec<u8>| {
            uuid_from_le_bytes(&bytes).ok_or(FrameError::InvalidUuidLength(bytes.len()))
        };

        let event = match (class_id, command_id) {
            (CLASS_SYSTEM, 0x00) => BgEvent::SystemBoot(FirmwareInfo::decode(&mut r)?),
            (CLASS_CONNECTION, 0x00) => BgEvent::ConnectionStatus {
                connection: r.read_u8()?,
                flags: ConnectionStatusFlags(r.read_u8()?),
                address: BluetoothAddress::from_le_bytes(r.read_address()?),
                address_type: BgAddressType::from_u8(r.read_u8()?),
                conn_interval: r.read_u16()?,
                timeout: r.read_u16()?,
                latency: r.read_u16()?,
                bonding: r.read_u8()?,
            },
            (CLASS_CONNECTION, 0x04) => BgEvent::ConnectionDisconnected {
                connection: r.read_u8()?,
                reason: BgApiResponse::from_code(r.read_u16()?),
            },
            (CLASS_ATTCLIENT, 0x01) => BgEvent::AttClientProcedureCompleted {
                connection: r.read_u8()?,
                result: BgApiResponse::from_code(r.read_u16()?),
                handle: r.read_u16()?,
            },
            (CLASS_ATTCLIENT, 0x02) => BgEvent::AttClientGroupFound {
                connection: r.read_u8()?,
                start: r.read_u16()?,
                end: r.read_u16()?,
                uuid: uuid(r.read_array()?)?,
            },
            (CLASS_ATTCLIENT, 0x04) => BgEvent::AttClientFindInformationFound {
                connection: r.read_u8()?,
                handle: r.read_u16()?,
                uuid: uuid(r.read_array()?)?,
            },
            (CLASS_ATTCLIENT, 0x05) => BgEvent::AttClientAttributeValue {
                connection: r.read_u8()?,
                handle: r.read_u16()?,
                value_type: AttributeValueType::from_u8(r.read_u8()?),
                value: r.read_array()?,
            },
            (CLASS_GAP, 0x00) => BgEvent::GapScanResponse {
                rssi: r.read_i8()?,
                packet_type: ScanResponseType::from_u8(r.read_u8()?),
                sender: BluetoothAddress::from_le_bytes(r.read_address()?),
                address_type: BgAddressType::from_u8(r.read_u8()?),
                bond: r.read_u8()?,
                data: r.read_array()?,
            },
            (class, command) => {
                return Err(FrameError::UnknownMessage {
                    kind: MessageKind::Event,
                    class,
                    command,
                })
            }
        };
        Ok(event)
    }

    /// Encode as the dongle would send it
    pub fn to_frame(&self) -> Frame {
        let w = PayloadWriter::new();
        let payload = match self {
            BgEvent::SystemBoot(info) => info.encode(w).finish(),
            BgEvent::ConnectionStatus {
                connection,
                flags,
                address,
                address_type,
                conn_interval,
                timeout,
                latency,
                bonding,
            } => w
                .u8(*connection)
                .u8(flags.0)
                .address(address.to_le_bytes())
                .u8(address_type.to_u8())
                .u16(*conn_interval)
                .u16(*timeout)
                .u16(*latency)
                .u8(*bonding)
                .finish(),
            BgEvent::ConnectionDisconnected { connection, reason } => {
                w.u8(*connection).u16(reason.code()).finish()
            }
            BgEvent::AttClientProcedureCompleted {
                connection,
                result,
                handle,
            } => w.u8(*connection).u16(result.code()).u16(*handle).finish(),
            BgEvent::AttClientGroupFound {
                connection,
                start,
                end,
                uuid,
            } => w
                .u8(*connection)
                .u16(*start)
                .u16(*end)
                .array(&uuid_to_le_bytes(uuid))
                .finish(),
            BgEvent::AttClientFindInformationFound {
                connection,
                handle,
                uuid,
            } => w
                .u8(*connection)
                .u16(*handle)
                .array(&uuid_to_le_bytes(uuid))
                .finish(),
            BgEvent::AttClientAttributeValue {
                connection,
                handle,
                value_type,
                value,
            } => w
                .u8(*connection)
                .u16(*handle)
                .u8(value_type.to_u8())
                .array(value)
                .finish(),
            BgEvent::GapScanResponse {
                rssi,
                packet_type,
                sender,
                address_type,
                bond,
                data,
            } => w
                .i8(*rssi)
                .u8(packet_type.to_u8())
                .address(sender.to_le_bytes())
                .u8(address_type.to_u8())
                .u8(*bond)
                .array(data)
                .finish(),
        };
        let (class_id, command_id) = self.id();
        Frame::new(MessageKind::Event, class_id, command_id, payload)
    }
}

/// A decoded inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BgMessage {
    Response(BgResponse),
    Event(BgEvent),
}

impl BgMessage {
    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        match frame.kind {
            MessageKind::Response => {
                BgResponse::decode(frame.class_id, frame.command_id, &frame.payload)
                    .map(BgMessage::Response)
            }
            MessageKind::Event => BgEvent::decode(frame.class_id, frame.command_id, &frame.payload)
                .map(BgMessage::Event),
        }
    }
}
