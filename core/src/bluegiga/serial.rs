//! BGAPI transaction channel.
//!
//! Owns the byte stream to the dongle. A dedicated reader task decodes inbound
//! frames: responses complete the single outstanding transaction, events fan out
//! to [`BgEventListener`]s in registration order. Callers of
//! [`SerialHandler::send_transaction`] are serialized on the writer lock, so at most
//! one command is in flight at any time.

use super::command::BgCommand;
use super::frame::{Frame, FrameDecoder};
use super::message::{BgEvent, BgMessage, BgResponse};
use crate::error::BluetoothError;
use crate::listener::{ListenerSet, Subscription};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 256;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives unsolicited BGAPI events
pub trait BgEventListener: Send + Sync {
    fn bluegiga_event_received(&self, event: &BgEvent);

    /// The inbound stream ended or failed; no further events will arrive
    fn channel_closed(&self) {}
}

struct Pending {
    id: (u8, u8),
    reply: oneshot::Sender<BgResponse>,
}

struct Shared {
    pending: Mutex<Option<Pending>>,
    listeners: ListenerSet<dyn BgEventListener>,
    closed: AtomicBool,
}

impl Shared {
    fn dispatch(&self, frame: Frame) {
        trace!(
            "RX {} {:#04x}/{:#04x} {}",
            frame.kind,
            frame.class_id,
            frame.command_id,
            hex::encode(&frame.payload)
        );
        match BgMessage::decode(&frame) {
            Ok(BgMessage::Response(response)) => self.complete(response),
            Ok(BgMessage::Event(event)) => {
                self.listeners
                    .notify("bluegiga event", |l| l.bluegiga_event_received(&event));
            }
            Err(e) => warn!("Dropping malformed {} frame: {}", frame.kind, e),
        }
    }

    fn complete(&self, response: BgResponse) {
        let mut pending = self.pending.lock();
        match pending.take() {
            Some(p) if p.id == response.id() => {
                if p.reply.send(response).is_err() {
                    debug!("Transaction caller went away before its response arrived");
                }
            }
            Some(p) => {
                warn!(
                    "Response {:?} does not match outstanding {:#04x}/{:#04x}, dropped",
                    response.id(),
                    p.id.0,
                    p.id.1
                );
                *pending = Some(p);
            }
            None => warn!("Unsolicited response {:?} dropped", response),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Dropping the sender wakes the waiting caller with ChannelClosed
            self.pending.lock().take();
            self.listeners.notify("channel closed", |l| l.channel_closed());
        }
    }
}

/// Request/response channel over a BGAPI byte stream
pub struct SerialHandler {
    writer: AsyncMutex<Option<BoxedWriter>>,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl SerialHandler {
    /// Take ownership of `stream` and start the reader task. Must be called from
    /// within a tokio runtime.
    pub fn new<S>(stream: S, timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            listeners: ListenerSet::new(),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared)));

        Self {
            writer: AsyncMutex::new(Some(Box::new(write_half))),
            shared,
            reader: Mutex::new(Some(reader)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn add_event_listener(&self, listener: Arc<dyn BgEventListener>) -> Subscription {
        self.shared.listeners.add(listener)
    }

    /// Send `command` and wait for its response.
    ///
    /// A write failure fails this transaction only; the channel stays usable.
    /// Once written, the command is never cancelled: the caller waits for the
    /// response or the timeout.
    pub async fn send_transaction(&self, command: BgCommand) -> Result<BgResponse, BluetoothError> {
        let bytes = command.to_bytes()?;

        let mut writer = self.writer.lock().await;
        let stream = match writer.as_mut() {
            Some(stream) if !self.is_closed() => stream,
            _ => return Err(BluetoothError::ChannelClosed),
        };

        let (tx, rx) = oneshot::channel();
        *self.shared.pending.lock() = Some(Pending {
            id: command.id(),
            reply: tx,
        });

        debug!("-> {}", command.name());
        trace!("TX {}", hex::encode(&bytes));
        let written = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = written {
            self.shared.pending.lock().take();
            warn!("Failed to write {}: {}", command.name(), e);
            return Err(BluetoothError::Io(e));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => {
                debug!("<- {} {:?}", command.name(), response.result());
                Ok(response)
            }
            Ok(Err(_)) => Err(BluetoothError::ChannelClosed),
            Err(_) => {
                self.shared.pending.lock().take();
                warn!("{} timed out after {:?}", command.name(), self.timeout);
                Err(BluetoothError::Timeout(self.timeout))
            }
        }
    }

    /// Stop the reader task and release the stream
    pub async fn close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.close();
        if let Some(mut stream) = self.writer.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error shutting down stream: {}", e);
            }
        }
        info!("BGAPI channel closed");
    }
}

impl Drop for SerialHandler {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("BGAPI stream reached end of file");
                break;
            }
            Ok(n) => {
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    shared.dispatch(frame);
                }
            }
            Err(e) => {
                warn!("BGAPI stream read failed: {}", e);
                break;
            }
        }
    }
    shared.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluegiga::message::FirmwareInfo;
    use crate::bluegiga::types::BgApiResponse;
    use tokio::io::DuplexStream;

    struct Recorder {
        events: Mutex<Vec<BgEvent>>,
        closed: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl BgEventListener for Recorder {
        fn bluegiga_event_received(&self, event: &BgEvent) {
            self.events.lock().push(event.clone());
        }

        fn channel_closed(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl BgEventListener for Panicker {
        fn bluegiga_event_received(&self, _event: &BgEvent) {
            panic!("listener failure");
        }
    }

    async fn read_frame(dongle: &mut DuplexStream) -> Frame {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 64];
        loop {
            if let Some(frame) = decoder.next_frame() {
                return frame;
            }
            let n = dongle.read(&mut buf).await.unwrap();
            assert!(n > 0, "host closed the stream");
            decoder.extend(&buf[..n]);
        }
    }

    fn boot_event() -> BgEvent {
        BgEvent::SystemBoot(FirmwareInfo {
            major: 1,
            minor: 3,
            patch: 2,
            build: 122,
            ll_version: 5,
            protocol_version: 1,
            hardware: 3,
        })
    }

    #[tokio::test]
    async fn test_transaction_receives_matching_response() {
        let (host, mut dongle) = tokio::io::duplex(1024);
        let channel = SerialHandler::new(host, Duration::from_secs(1));

        let dongle_task = tokio::spawn(async move {
            let frame = read_frame(&mut dongle).await;
            assert_eq!((frame.class_id, frame.command_id), (0x06, 0x04));
            let reply = BgResponse::GapEndProcedure {
                result: BgApiResponse::Success,
            };
            dongle
                .write_all(&reply.to_frame().to_bytes().unwrap())
                .await
                .unwrap();
            dongle
        });

        let response = channel.send_transaction(BgCommand::GapEndProcedure).await.unwrap();
        assert!(response.is_success());
        let _dongle = dongle_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_times_out() {
        let (host, _dongle) = tokio::io::duplex(1024);
        let channel = SerialHandler::new(host, Duration::from_millis(50));

        let result = channel.send_transaction(BgCommand::SystemHello).await;
        assert!(matches!(result, Err(BluetoothError::Timeout(_))));
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_mismatched_response_is_dropped() {
        let (host, mut dongle) = tokio::io::duplex(1024);
        let channel = SerialHandler::new(host, Duration::from_secs(1));

        let dongle_task = tokio::spawn(async move {
            read_frame(&mut dongle).await;
            let wrong = BgResponse::GapDiscover {
                result: BgApiResponse::Success,
            };
            let right = BgResponse::SystemGetConnections { max_connections: 4 };
            let mut bytes = wrong.to_frame().to_bytes().unwrap();
            bytes.extend(right.to_frame().to_bytes().unwrap());
            dongle.write_all(&bytes).await.unwrap();
            dongle
        });

        let response = channel
            .send_transaction(BgCommand::SystemGetConnections)
            .await
            .unwrap();
        assert_eq!(response, BgResponse::SystemGetConnections { max_connections: 4 });
        let _dongle = dongle_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_reach_listeners_despite_panic() {
        let (host, mut dongle) = tokio::io::duplex(1024);
        let channel = SerialHandler::new(host, Duration::from_secs(1));
        let first = Recorder::new();
        let second = Recorder::new();
        let _a = channel.add_event_listener(first.clone());
        let _b = channel.add_event_listener(Arc::new(Panicker));
        let _c = channel.add_event_listener(second.clone());

        dongle
            .write_all(&boot_event().to_frame().to_bytes().unwrap())
            .await
            .unwrap();

        for _ in 0..50 {
            if !second.events.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(first.events.lock().as_slice(), &[boot_event()]);
        assert_eq!(second.events.lock().as_slice(), &[boot_event()]);
    }

    #[tokio::test]
    async fn test_eof_closes_channel() {
        let (host, dongle) = tokio::io::duplex(1024);
        let channel = SerialHandler::new(host, Duration::from_secs(1));
        let recorder = Recorder::new();
        let _sub = channel.add_event_listener(recorder.clone());

        drop(dongle);
        for _ in 0..50 {
            if channel.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(channel.is_closed());
        assert!(recorder.closed.load(Ordering::SeqCst));
        assert!(matches!(
            channel.send_transaction(BgCommand::SystemHello).await,
            Err(BluetoothError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_further_transactions() {
        let (host, _dongle) = tokio::io::duplex(1024);
        let channel = SerialHandler::new(host, Duration::from_secs(1));
        channel.close().await;
        assert!(channel.is_closed());
        assert!(matches!(
            channel.send_transaction(BgCommand::GapEndProcedure).await,
            Err(BluetoothError::ChannelClosed)
        ));
    }
}
