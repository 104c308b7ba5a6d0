//! Advertising data (AD structure) parsing for scan responses

use crate::gatt::uuid_from_le_bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

pub const AD_FLAGS: u8 = 0x01;
pub const AD_INCOMPLETE_UUID16: u8 = 0x02;
pub const AD_COMPLETE_UUID16: u8 = 0x03;
pub const AD_INCOMPLETE_UUID32: u8 = 0x04;
pub const AD_COMPLETE_UUID32: u8 = 0x05;
pub const AD_INCOMPLETE_UUID128: u8 = 0x06;
pub const AD_COMPLETE_UUID128: u8 = 0x07;
pub const AD_SHORTENED_LOCAL_NAME: u8 = 0x08;
pub const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const AD_TX_POWER_LEVEL: u8 = 0x0A;
pub const AD_MANUFACTURER_SPECIFIC: u8 = 0xFF;

/// Fields decoded from an advertisement or scan response payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementData {
    pub flags: Option<u8>,
    pub local_name: Option<String>,
    /// True when `local_name` came from a complete-name structure
    pub name_complete: bool,
    pub tx_power: Option<i8>,
    pub manufacturer_id: Option<u16>,
    pub manufacturer_data: Vec<u8>,
    pub service_uuids: Vec<Uuid>,
}

impl AdvertisementData {
    /// Parse a sequence of `[len][type][data..]` structures.
    ///
    /// Parsing stops at a zero length (padding) or at a structure that runs past
    /// the end of the payload; everything decoded up to that point is kept.
    pub fn parse(data: &[u8]) -> Self {
        let mut parsed = AdvertisementData::default();
        let mut offset = 0;

        while offset < data.len() {
            let len = data[offset] as usize;
            if len == 0 {
                break;
            }
            if offset + 1 + len > data.len() {
                debug!(
                    "Truncated AD structure at offset {} (len {}, {} bytes left)",
                    offset,
                    len,
                    data.len() - offset - 1
                );
                break;
            }
            let ad_type = data[offset + 1];
            let body = &data[offset + 2..offset + 1 + len];
            parsed.apply(ad_type, body);
            offset += 1 + len;
        }

        parsed
    }

    fn apply(&mut self, ad_type: u8, body: &[u8]) {
        match ad_type {
            AD_FLAGS => self.flags = body.first().copied(),
            AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => self.push_uuids(body, 2),
            AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => self.push_uuids(body, 4),
            AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => self.push_uuids(body, 16),
            AD_SHORTENED_LOCAL_NAME => {
                // A complete name always wins over a shortened one
                if !self.name_complete {
                    self.local_name = Some(String::from_utf8_lossy(body).into_owned());
                }
            }
            AD_COMPLETE_LOCAL_NAME => {
                self.local_name = Some(String::from_utf8_lossy(body).into_owned());
                self.name_complete = true;
            }
            AD_TX_POWER_LEVEL => self.tx_power = body.first().map(|b| *b as i8),
            AD_MANUFACTURER_SPECIFIC if body.len() >= 2 => {
                self.manufacturer_id = Some(u16::from_le_bytes([body[0], body[1]]));
                self.manufacturer_data = body[2..].to_vec();
            }
            _ => {}
        }
    }

    fn push_uuids(&mut self, body: &[u8], width: usize) {
        for chunk in body.chunks_exact(width) {
            if let Some(uuid) = uuid_from_le_bytes(chunk) {
                if !self.service_uuids.contains(&uuid) {
                    self.service_uuids.push(uuid);
                }
            }
        }
    }
}
