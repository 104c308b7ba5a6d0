//! BlueGiga BGAPI backend
//!
//! Layers, bottom up: packet framing ([`frame`]), typed commands, responses and
//! events ([`command`], [`message`], [`types`]), the transaction channel
//! ([`serial`]) and the adapter that implements the shared abstractions
//! ([`adapter`]).

pub mod adapter;
pub mod command;
pub mod frame;
pub mod message;
pub mod port;
pub mod procedure;
pub mod serial;
pub mod types;

pub use adapter::{AdapterInfo, BlueGigaAdapter};
pub use command::BgCommand;
pub use frame::{Frame, FrameDecoder, FrameError, MessageKind};
pub use message::{BgEvent, BgMessage, BgResponse, FirmwareInfo};
pub use procedure::GattProcedure;
pub use serial::{BgEventListener, SerialHandler};
pub use types::{BgAddressType, BgApiResponse};
