//! Scripted BlueGiga dongle for integration tests.
//!
//! Sits on the far end of a `tokio::io::duplex` pipe, records every command the
//! host sends and answers it. Result codes can be overridden per command and
//! events injected at any time.
#![allow(dead_code)]

use blegate_core::bluegiga::command::{CLASS_ATTCLIENT, CLASS_CONNECTION, CLASS_GAP, CLASS_SYSTEM};
use blegate_core::bluegiga::message::{BgEvent, BgResponse, FirmwareInfo};
use blegate_core::bluegiga::types::{
    AttributeValueType, BgAddressType, BgApiResponse, ConnectionStatusFlags, ScanResponseType,
};
use blegate_core::bluegiga::{BlueGigaAdapter, Frame, FrameDecoder};
use blegate_core::{
    AdapterConfig, BluetoothAddress, Characteristic, CompletionStatus, ConnectionStatusNotification,
    DeviceListener, ScanNotification,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const DONGLE_ADDRESS: BluetoothAddress = BluetoothAddress::new([0x00, 0x07, 0x80, 0x11, 0x22, 0x33]);

pub const SET_MODE: (u8, u8) = (CLASS_GAP, 0x01);
pub const DISCOVER: (u8, u8) = (CLASS_GAP, 0x02);
pub const CONNECT_DIRECT: (u8, u8) = (CLASS_GAP, 0x03);
pub const END_PROCEDURE: (u8, u8) = (CLASS_GAP, 0x04);
pub const SET_SCAN_PARAMETERS: (u8, u8) = (CLASS_GAP, 0x07);
pub const DISCONNECT: (u8, u8) = (CLASS_CONNECTION, 0x00);
pub const READ_BY_GROUP_TYPE: (u8, u8) = (CLASS_ATTCLIENT, 0x01);
pub const FIND_INFORMATION: (u8, u8) = (CLASS_ATTCLIENT, 0x03);
pub const READ_BY_HANDLE: (u8, u8) = (CLASS_ATTCLIENT, 0x04);
pub const ATTRIBUTE_WRITE: (u8, u8) = (CLASS_ATTCLIENT, 0x05);
pub const ADDRESS_GET: (u8, u8) = (CLASS_SYSTEM, 0x02);

pub fn firmware() -> FirmwareInfo {
    FirmwareInfo {
        major: 1,
        minor: 3,
        patch: 2,
        build: 122,
        ll_version: 6,
        protocol_version: 1,
        hardware: 3,
    }
}

#[derive(Default)]
struct Script {
    max_connections: u8,
    results: HashMap<(u8, u8), BgApiResponse>,
    silent: HashSet<(u8, u8)>,
    next_handle: u8,
}

pub struct FakeDongle {
    received: Arc<Mutex<Vec<Frame>>>,
    script: Arc<Mutex<Script>>,
    writer: Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>,
    task: JoinHandle<()>,
}

impl FakeDongle {
    /// Create a dongle and the host end of its pipe
    pub fn new(max_connections: u8) -> (Self, DuplexStream) {
        let (host, dongle) = tokio::io::duplex(8192);
        let (mut reader, writer) = tokio::io::split(dongle);
        let received = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(Script {
            max_connections,
            ..Script::default()
        }));
        let writer = Arc::new(tokio::sync::Mutex::new(writer));

        let task = {
            let received = Arc::clone(&received);
            let script = Arc::clone(&script);
            let writer = Arc::clone(&writer);
            tokio::spawn(async move {
                let mut decoder = FrameDecoder::new();
                let mut buf = [0u8; 512];
                loop {
                    let n = match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    decoder.extend(&buf[..n]);
                    while let Some(frame) = decoder.next_frame() {
                        received.lock().push(frame.clone());
                        let reply = answer(&mut script.lock(), &frame);
                        if let Some(reply) = reply {
                            let bytes = reply.to_frame().to_bytes().unwrap();
                            if writer.lock().await.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            })
        };

        (
            Self {
                received,
                script,
                writer,
                task,
            },
            host,
        )
    }

    /// Answer `id` with `result` from now on
    pub fn set_result(&self, id: (u8, u8), result: BgApiResponse) {
        self.script.lock().results.insert(id, result);
    }

    /// Never answer `id`
    pub fn ignore(&self, id: (u8, u8)) {
        self.script.lock().silent.insert(id);
    }

    pub async fn emit(&self, event: BgEvent) {
        let bytes = event.to_frame().to_bytes().unwrap();
        self.writer.lock().await.write_all(&bytes).await.unwrap();
    }

    /// Write bytes verbatim, e.g. a corrupt frame
    pub async fn emit_raw(&self, bytes: &[u8]) {
        self.writer.lock().await.write_all(bytes).await.unwrap();
    }

    pub fn commands(&self) -> Vec<(u8, u8)> {
        self.received
            .lock()
            .iter()
            .map(|f| (f.class_id, f.command_id))
            .collect()
    }

    pub fn count(&self, id: (u8, u8)) -> usize {
        self.commands().into_iter().filter(|c| *c == id).count()
    }

    /// Payloads of every `id` command, oldest first
    pub fn payloads(&self, id: (u8, u8)) -> Vec<Vec<u8>> {
        self.received
            .lock()
            .iter()
            .filter(|f| (f.class_id, f.command_id) == id)
            .map(|f| f.payload.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.received.lock().clear();
    }

    pub async fn scan_response(&self, sender: BluetoothAddress, rssi: i8, data: &[u8]) {
        self.emit(BgEvent::GapScanResponse {
            rssi,
            packet_type: ScanResponseType::ConnectableAdvertisement,
            sender,
            address_type: BgAddressType::Public,
            bond: 0xFF,
            data: data.to_vec(),
        })
        .await;
    }

    pub async fn connection_up(&self, connection: u8, address: BluetoothAddress) {
        self.emit(BgEvent::ConnectionStatus {
            connection,
            flags: ConnectionStatusFlags(
                ConnectionStatusFlags::CONNECTED | ConnectionStatusFlags::COMPLETED,
            ),
            address,
            address_type: BgAddressType::Public,
            conn_interval: 80,
            timeout: 100,
            latency: 0,
            bonding: 0xFF,
        })
        .await;
    }

    pub async fn connection_down(&self, connection: u8) {
        self.emit(BgEvent::ConnectionDisconnected {
            connection,
            reason: BgApiResponse::ConnectionTerminatedByLocalHost,
        })
        .await;
    }

    pub async fn attribute_value(&self, connection: u8, handle: u16, value_type: AttributeValueType, value: &[u8]) {
        self.emit(BgEvent::AttClientAttributeValue {
            connection,
            handle,
            value_type,
            value: value.to_vec(),
        })
        .await;
    }

    pub async fn procedure_completed(&self, connection: u8, result: BgApiResponse, handle: u16) {
        self.emit(BgEvent::AttClientProcedureCompleted {
            connection,
            result,
            handle,
        })
        .await;
    }

    pub async fn group_found(&self, connection: u8, start: u16, end: u16, uuid: Uuid) {
        self.emit(BgEvent::AttClientGroupFound {
            connection,
            start,
            end,
            uuid,
        })
        .await;
    }

    pub async fn information_found(&self, connection: u8, handle: u16, uuid: Uuid) {
        self.emit(BgEvent::AttClientFindInformationFound {
            connection,
            handle,
            uuid,
        })
        .await;
    }
}

impl Drop for FakeDongle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn answer(script: &mut Script, frame: &Frame) -> Option<BgResponse> {
    let id = (frame.class_id, frame.command_id);
    if script.silent.contains(&id) {
        return None;
    }
    let result = script.results.get(&id).copied().unwrap_or(BgApiResponse::Success);
    let connection = frame.payload.first().copied().unwrap_or(0);

    let response = match id {
        (CLASS_SYSTEM, 0x01) => BgResponse::SystemHello,
        (CLASS_SYSTEM, 0x02) => BgResponse::SystemAddressGet {
            address: DONGLE_ADDRESS,
        },
        (CLASS_SYSTEM, 0x06) => BgResponse::SystemGetConnections {
            max_connections: script.max_connections,
        },
        (CLASS_SYSTEM, 0x08) => BgResponse::SystemGetInfo(firmware()),
        (CLASS_CONNECTION, 0x00) => BgResponse::ConnectionDisconnect { connection, result },
        (CLASS_CONNECTION, 0x01) => BgResponse::ConnectionGetRssi {
            connection,
            rssi: -55,
        },
        (CLASS_ATTCLIENT, 0x01) => BgResponse::AttClientReadByGroupType { connection, result },
        (CLASS_ATTCLIENT, 0x03) => BgResponse::AttClientFindInformation { connection, result },
        (CLASS_ATTCLIENT, 0x04) => BgResponse::AttClientReadByHandle { connection, result },
        (CLASS_ATTCLIENT, 0x05) => BgResponse::AttClientAttributeWrite { connection, result },
        (CLASS_GAP, 0x01) => BgResponse::GapSetMode { result },
        (CLASS_GAP, 0x02) => BgResponse::GapDiscover { result },
        (CLASS_GAP, 0x03) => {
            let handle = script.next_handle;
            if result.is_success() {
                script.next_handle = script.next_handle.wrapping_add(1);
            }
            BgResponse::GapConnectDirect {
                result,
                connection: handle,
            }
        }
        (CLASS_GAP, 0x04) => BgResponse::GapEndProcedure { result },
        (CLASS_GAP, 0x07) => BgResponse::GapSetScanParameters { result },
        _ => return None,
    };
    Some(response)
}

/// Configuration with short timeouts for tests
pub fn test_config() -> AdapterConfig {
    AdapterConfig {
        transaction_timeout_ms: 300,
        connect_retry_delay_ms: 20,
        ..AdapterConfig::default()
    }
}

/// Adapter wired to a fake dongle and already initialized
pub async fn initialized_adapter(max_connections: u8) -> (Arc<BlueGigaAdapter>, FakeDongle) {
    let (dongle, host) = FakeDongle::new(max_connections);
    let adapter = BlueGigaAdapter::new(host, test_config()).unwrap();
    assert!(adapter.initialize().await.unwrap());
    dongle.clear();
    (adapter, dongle)
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Device callbacks, recorded in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    ScanRecord { rssi: i8 },
    StateChange(blegate_core::ConnectionState),
    ServicesDiscovered,
    ReadComplete { handle: u16, value: Vec<u8>, status: CompletionStatus },
    WriteComplete { handle: u16, status: CompletionStatus },
    Update { handle: u16, value: Vec<u8> },
}

#[derive(Default)]
pub struct DeviceRecorder {
    pub callbacks: Mutex<Vec<Callback>>,
}

impl DeviceRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<Callback> {
        self.callbacks.lock().clone()
    }

    pub fn contains(&self, callback: &Callback) -> bool {
        self.callbacks.lock().contains(callback)
    }
}

impl DeviceListener for DeviceRecorder {
    fn on_scan_record_received(&self, notification: &ScanNotification) {
        self.callbacks.lock().push(Callback::ScanRecord {
            rssi: notification.rssi,
        });
    }

    fn on_connection_state_change(&self, notification: &ConnectionStatusNotification) {
        self.callbacks
            .lock()
            .push(Callback::StateChange(notification.state));
    }

    fn on_services_discovered(&self) {
        self.callbacks.lock().push(Callback::ServicesDiscovered);
    }

    fn on_characteristic_read_complete(&self, characteristic: &Characteristic, status: CompletionStatus) {
        self.callbacks.lock().push(Callback::ReadComplete {
            handle: characteristic.handle(),
            value: characteristic.value().to_vec(),
            status,
        });
    }

    fn on_characteristic_write_complete(&self, characteristic: &Characteristic, status: CompletionStatus) {
        self.callbacks.lock().push(Callback::WriteComplete {
            handle: characteristic.handle(),
            status,
        });
    }

    fn on_characteristic_update(&self, characteristic: &Characteristic) {
        self.callbacks.lock().push(Callback::Update {
            handle: characteristic.handle(),
            value: characteristic.value().to_vec(),
        });
    }
}
