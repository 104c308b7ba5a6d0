//! BGAPI enumerations

use crate::address::AddressType;
use std::fmt;

/// Result code carried by BGAPI responses and some events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BgApiResponse {
    Success,
    // BGAPI errors
    InvalidParameter,
    DeviceInWrongState,
    OutOfMemory,
    FeatureNotImplemented,
    CommandNotRecognized,
    Timeout,
    NotConnected,
    Flow,
    UserAttribute,
    InvalidLicenseKey,
    CommandTooLong,
    OutOfBonds,
    // Bluetooth controller errors
    AuthenticationFailure,
    PinOrKeyMissing,
    MemoryCapacityExceeded,
    ConnectionTimeout,
    ConnectionLimitExceeded,
    CommandDisallowed,
    InvalidCommandParameters,
    RemoteUserTerminatedConnection,
    ConnectionTerminatedByLocalHost,
    LlResponseTimeout,
    LlInstantPassed,
    ControllerBusy,
    UnacceptableConnectionInterval,
    DirectedAdvertisingTimeout,
    MicFailure,
    ConnectionFailedToBeEstablished,
    // Security manager errors
    PasskeyEntryFailed,
    OobDataNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    RepeatedAttempts,
    InvalidParameters,
    // Attribute protocol errors
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    ApplicationErrorCodes,
    /// Code not in the table above
    Unknown(u16),
}

const RESULT_CODES: &[(u16, BgApiResponse)] = &[
    (0x0000, BgApiResponse::Success),
    (0x0180, BgApiResponse::InvalidParameter),
    (0x0181, BgApiResponse::DeviceInWrongState),
    (0x0182, BgApiResponse::OutOfMemory),
    (0x0183, BgApiResponse::FeatureNotImplemented),
    (0x0184, BgApiResponse::CommandNotRecognized),
    (0x0185, BgApiResponse::Timeout),
    (0x0186, BgApiResponse::NotConnected),
    (0x0187, BgApiResponse::Flow),
    (0x0188, BgApiResponse::UserAttribute),
    (0x0189, BgApiResponse::InvalidLicenseKey),
    (0x018A, BgApiResponse::CommandTooLong),
    (0x018B, BgApiResponse::OutOfBonds),
    (0x0205, BgApiResponse::AuthenticationFailure),
    (0x0206, BgApiResponse::PinOrKeyMissing),
    (0x0207, BgApiResponse::MemoryCapacityExceeded),
    (0x0208, BgApiResponse::ConnectionTimeout),
    (0x0209, BgApiResponse::ConnectionLimitExceeded),
    (0x020C, BgApiResponse::CommandDisallowed),
    (0x0212, BgApiResponse::InvalidCommandParameters),
    (0x0213, BgApiResponse::RemoteUserTerminatedConnection),
    (0x0216, BgApiResponse::ConnectionTerminatedByLocalHost),
    (0x0222, BgApiResponse::LlResponseTimeout),
    (0x0228, BgApiResponse::LlInstantPassed),
    (0x023A, BgApiResponse::ControllerBusy),
    (0x023B, BgApiResponse::UnacceptableConnectionInterval),
    (0x023C, BgApiResponse::DirectedAdvertisingTimeout),
    (0x023D, BgApiResponse::MicFailure),
    (0x023E, BgApiResponse::ConnectionFailedToBeEstablished),
    (0x0301, BgApiResponse::PasskeyEntryFailed),
    (0x0302, BgApiResponse::OobDataNotAvailable),
    (0x0303, BgApiResponse::AuthenticationRequirements),
    (0x0304, BgApiResponse::ConfirmValueFailed),
    (0x0305, BgApiResponse::PairingNotSupported),
    (0x0306, BgApiResponse::EncryptionKeySize),
    (0x0307, BgApiResponse::CommandNotSupported),
    (0x0308, BgApiResponse::UnspecifiedReason),
    (0x0309, BgApiResponse::RepeatedAttempts),
    (0x030A, BgApiResponse::InvalidParameters),
    (0x0401, BgApiResponse::InvalidHandle),
    (0x0402, BgApiResponse::ReadNotPermitted),
    (0x0403, BgApiResponse::WriteNotPermitted),
    (0x0404, BgApiResponse::InvalidPdu),
    (0x0405, BgApiResponse::InsufficientAuthentication),
    (0x0406, BgApiResponse::RequestNotSupported),
    (0x0407, BgApiResponse::InvalidOffset),
    (0x0408, BgApiResponse::InsufficientAuthorization),
    (0x0409, BgApiResponse::PrepareQueueFull),
    (0x040A, BgApiResponse::AttributeNotFound),
    (0x040B, BgApiResponse::AttributeNotLong),
    (0x040C, BgApiResponse::InsufficientEncryptionKeySize),
    (0x040D, BgApiResponse::InvalidAttributeValueLength),
    (0x040E, BgApiResponse::UnlikelyError),
    (0x040F, BgApiResponse::InsufficientEncryption),
    (0x0410, BgApiResponse::UnsupportedGroupType),
    (0x0411, BgApiResponse::InsufficientResources),
    (0x0480, BgApiResponse::ApplicationErrorCodes),
];

impl BgApiResponse {
    pub fn from_code(code: u16) -> Self {
        RESULT_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, r)| *r)
            .unwrap_or(BgApiResponse::Unknown(code))
    }

    pub fn code(&self) -> u16 {
        match self {
            BgApiResponse::Unknown(code) => *code,
            known => RESULT_CODES
                .iter()
                .find(|(_, r)| r == known)
                .map(|(c, _)| *c)
                .unwrap_or(0xFFFF),
        }
    }

    pub fn is_success(&self) -> bool {
        *self == BgApiResponse::Success
    }
}

impl fmt::Display for BgApiResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#06x})", self, self.code())
    }
}

/// Address type byte used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BgAddressType {
    Public,
    Random,
    Unknown(u8),
}

impl BgAddressType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => BgAddressType::Public,
            1 => BgAddressType::Random,
            other => BgAddressType::Unknown(other),
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            BgAddressType::Public => 0,
            BgAddressType::Random => 1,
            BgAddressType::Unknown(other) => *other,
        }
    }
}

impl From<BgAddressType> for AddressType {
    fn from(value: BgAddressType) -> Self {
        match value {
            BgAddressType::Public => AddressType::Public,
            BgAddressType::Random => AddressType::Random,
            BgAddressType::Unknown(_) => AddressType::Unknown,
        }
    }
}

impl From<AddressType> for BgAddressType {
    /// Unknown addresses are attempted as public, the common case for peripherals
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public | AddressType::Unknown => BgAddressType::Public,
            AddressType::Random => BgAddressType::Random,
        }
    }
}

/// GAP connectable mode for `gap_set_mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GapConnectableMode {
    NonConnectable = 0,
    DirectedConnectable = 1,
    UndirectedConnectable = 2,
    ScannableNonConnectable = 3,
}

/// GAP discoverable mode for `gap_set_mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GapDiscoverableMode {
    NonDiscoverable = 0,
    LimitedDiscoverable = 1,
    GeneralDiscoverable = 2,
    Broadcast = 3,
    UserData = 4,
}

/// GAP discover procedure for `gap_discover`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GapDiscoverMode {
    Limited = 0,
    Generic = 1,
    /// Report every advertiser regardless of its discoverable flags
    Observation = 2,
}

/// Advertising packet category in a scan response event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanResponseType {
    ConnectableAdvertisement,
    NonConnectableAdvertisement,
    ScanResponse,
    DiscoverableAdvertisement,
    Unknown(u8),
}

impl ScanResponseType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ScanResponseType::ConnectableAdvertisement,
            2 => ScanResponseType::NonConnectableAdvertisement,
            4 => ScanResponseType::ScanResponse,
            6 => ScanResponseType::DiscoverableAdvertisement,
            other => ScanResponseType::Unknown(other),
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            ScanResponseType::ConnectableAdvertisement => 0,
            ScanResponseType::NonConnectableAdvertisement => 2,
            ScanResponseType::ScanResponse => 4,
            ScanResponseType::DiscoverableAdvertisement => 6,
            ScanResponseType::Unknown(other) => *other,
        }
    }
}

/// How an attribute value event was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeValueType {
    Read,
    Notify,
    Indicate,
    ReadByType,
    ReadBlob,
    IndicateRspReq,
    Unknown(u8),
}

impl AttributeValueType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => AttributeValueType::Read,
            1 => AttributeValueType::Notify,
            2 => AttributeValueType::Indicate,
            3 => AttributeValueType::ReadByType,
            4 => AttributeValueType::ReadBlob,
            5 => AttributeValueType::IndicateRspReq,
            other => AttributeValueType::Unknown(other),
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            AttributeValueType::Read => 0,
            AttributeValueType::Notify => 1,
            AttributeValueType::Indicate => 2,
            AttributeValueType::ReadByType => 3,
            AttributeValueType::ReadBlob => 4,
            AttributeValueType::IndicateRspReq => 5,
            AttributeValueType::Unknown(other) => *other,
        }
    }

    /// Pushed by the peripheral rather than requested
    pub fn is_unsolicited(&self) -> bool {
        matches!(
            self,
            AttributeValueType::Notify | AttributeValueType::Indicate | AttributeValueType::IndicateRspReq
        )
    }
}

/// Flags of a connection status event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatusFlags(pub u8);

impl ConnectionStatusFlags {
    pub const CONNECTED: u8 = 0x01;
    pub const ENCRYPTED: u8 = 0x02;
    pub const COMPLETED: u8 = 0x04;
    pub const PARAMETERS_CHANGE: u8 = 0x08;

    pub fn is_connected(&self) -> bool {
        self.0 & Self::CONNECTED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn is_completed(&self) -> bool {
        self.0 & Self::COMPLETED != 0
    }

    pub fn is_parameters_change(&self) -> bool {
        self.0 & Self::PARAMETERS_CHANGE != 0
    }
}
