// Bridges synchronous adapter/device callbacks into async channels for the CLI

use anyhow::{Context, Result};
use blegate_core::{
    Characteristic, CompletionStatus, ConnectionState, ConnectionStatusNotification, Device,
    DeviceListener, DiscoveryListener,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    State(ConnectionState),
    ServicesDiscovered,
    ReadComplete(Characteristic, CompletionStatus),
    WriteComplete(Characteristic, CompletionStatus),
    Update(Characteristic),
}

pub struct DeviceEvents {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceEvents {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: DeviceEvent) {
        // Receiver gone means the command finished
        let _ = self.tx.send(event);
    }
}

impl DeviceListener for DeviceEvents {
    fn on_connection_state_change(&self, notification: &ConnectionStatusNotification) {
        self.send(DeviceEvent::State(notification.state));
    }

    fn on_services_discovered(&self) {
        self.send(DeviceEvent::ServicesDiscovered);
    }

    fn on_characteristic_read_complete(&self, characteristic: &Characteristic, status: CompletionStatus) {
        self.send(DeviceEvent::ReadComplete(characteristic.clone(), status));
    }

    fn on_characteristic_write_complete(&self, characteristic: &Characteristic, status: CompletionStatus) {
        self.send(DeviceEvent::WriteComplete(characteristic.clone(), status));
    }

    fn on_characteristic_update(&self, characteristic: &Characteristic) {
        self.send(DeviceEvent::Update(characteristic.clone()));
    }
}

pub struct Discoveries {
    tx: mpsc::UnboundedSender<Arc<Device>>,
}

impl Discoveries {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Device>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl DiscoveryListener for Discoveries {
    fn device_discovered(&self, device: &Arc<Device>) {
        let _ = self.tx.send(Arc::clone(device));
    }
}

/// Wait until `select` accepts an event, or fail after `limit`
pub async fn wait_for<T, F>(
    rx: &mut mpsc::UnboundedReceiver<DeviceEvent>,
    limit: Duration,
    what: &str,
    mut select: F,
) -> Result<T>
where
    F: FnMut(DeviceEvent) -> Option<T>,
{
    tokio::time::timeout(limit, async {
        while let Some(event) = rx.recv().await {
            if let Some(found) = select(event) {
                return Some(found);
            }
        }
        None
    })
    .await
    .with_context(|| format!("Timed out waiting for {}", what))?
    .with_context(|| format!("Event stream ended while waiting for {}", what))
}
