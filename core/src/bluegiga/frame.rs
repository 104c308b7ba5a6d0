//! BGAPI packet framing
//!
//! Every packet is a 4-byte header followed by the payload:
//! `[type:1 | technology:4 | length_high:3] [length_low] [class] [command] payload..`
//! The type bit is 0 for commands/responses and 1 for events. Technology 0 is BLE.

use thiserror::Error;
use tracing::warn;

/// Size of the packet header
pub const HEADER_SIZE: usize = 4;

/// Payload length is an 11-bit field
pub const MAX_PAYLOAD_SIZE: usize = 0x07FF;

/// Longest payload a BLE dongle sends; a BLED112 packet is at most 64 bytes
pub const MAX_BLE_PAYLOAD: usize = 60;

const EVENT_BIT: u8 = 0x80;
const TECHNOLOGY_MASK: u8 = 0x78;
const LENGTH_HIGH_MASK: u8 = 0x07;

/// Errors for BGAPI framing and payload decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload truncated: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("Payload too long: {0} bytes")]
    PayloadTooLong(usize),
    #[error("Unknown {kind} class {class:#04x} command {command:#04x}")]
    UnknownMessage {
        kind: MessageKind,
        class: u8,
        command: u8,
    },
    #[error("Invalid UUID length: {0}")]
    InvalidUuidLength(usize),
}

/// Packet direction/category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Host command or its response (they share the header type bit)
    Response,
    Event,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Response => write!(f, "response"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// One BGAPI packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub class_id: u8,
    pub command_id: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageKind, class_id: u8, command_id: u8, payload: Vec<u8>) -> Self {
        Self {
            kind,
            class_id,
            command_id,
            payload,
        }
    }

    /// Serialize header and payload
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLong(len));
        }
        let mut first = ((len >> 8) as u8) & LENGTH_HIGH_MASK;
        if self.kind == MessageKind::Event {
            first |= EVENT_BIT;
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + len);
        bytes.push(first);
        bytes.push((len & 0xFF) as u8);
        bytes.push(self.class_id);
        bytes.push(self.command_id);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }
}

/// Incremental decoder for a BGAPI byte stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    discarded: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes dropped while resynchronising
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Pop the next complete frame, if any.
    ///
    /// A header whose technology field is not BLE, or whose length no BLE
    /// packet can have, cannot start a valid packet. Such bytes are dropped
    /// one at a time until the stream lines up again.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let first = *self.buffer.first()?;
            if first & TECHNOLOGY_MASK != 0 {
                self.skip_byte(first);
                continue;
            }
            let Some(&len_low) = self.buffer.get(1) else {
                return None;
            };
            let len = (((first & LENGTH_HIGH_MASK) as usize) << 8) | len_low as usize;
            if len > MAX_BLE_PAYLOAD {
                self.skip_byte(first);
                continue;
            }
            if self.buffer.len() < HEADER_SIZE + len {
                return None;
            }

            let kind = if first & EVENT_BIT != 0 {
                MessageKind::Event
            } else {
                MessageKind::Response
            };
            let class_id = self.buffer[2];
            let command_id = self.buffer[3];
            let payload = self.buffer[HEADER_SIZE..HEADER_SIZE + len].to_vec();
            self.buffer.drain(..HEADER_SIZE + len);
            return Some(Frame::new(kind, class_id, command_id, payload));
        }
    }

    fn skip_byte(&mut self, byte: u8) {
        self.buffer.remove(0);
        self.discarded += 1;
        warn!("Discarding out-of-sync byte {:#04x}", byte);
    }
}

/// Little-endian cursor over a packet payload
pub struct PayloadReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], FrameError> {
        let available = self.data.len().saturating_sub(self.offset);
        if available < needed {
            return Err(FrameError::Truncated {
                offset: self.offset,
                needed,
                available,
            });
        }
        let slice = &self.data[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, FrameError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, FrameError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// `bd_addr`, transmitted least-significant byte first
    pub fn read_address(&mut self) -> Result<[u8; 6], FrameError> {
        let b = self.take(6)?;
        let mut out = [0u8; 6];
        out.copy_from_slice(b);
        Ok(out)
    }

    /// `uint8array`: one length byte followed by the data
    pub fn read_array(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = self.read_u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// Little-endian payload builder
#[derive(Default)]
pub struct PayloadWriter {
    bytes: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    pub fn i8(self, value: i8) -> Self {
        self.u8(value as u8)
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn address(mut self, le_bytes: [u8; 6]) -> Self {
        self.bytes.extend_from_slice(&le_bytes);
        self
    }

    /// Length-prefixed array; data beyond 255 bytes is truncated
    pub fn array(mut self, data: &[u8]) -> Self {
        let len = data.len().min(u8::MAX as usize);
        self.bytes.push(len as u8);
        self.bytes.extend_from_slice(&data[..len]);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}
