use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::framing::LineFramer;
use super::status::StatusCell;
use super::transport::{ChunkReceiver, PortSelector, SerialTransport, DEFAULT_BAUD_RATE};
use super::{ConnectionStatus, DataSource, SourceError, SourceListener};
use crate::readings::Normalizer;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

struct ReadTask {
    port: String,
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

/// Line-delimited JSON over a serial port.
pub struct SerialAdapter {
    transport: Arc<dyn SerialTransport>,
    selector: Arc<dyn PortSelector>,
    baud_rate: u32,
    normalizer: Arc<Normalizer>,
    status: Arc<StatusCell>,
    reader: Option<ReadTask>,
}

impl SerialAdapter {
    pub fn new(
        transport: Arc<dyn SerialTransport>,
        selector: Arc<dyn PortSelector>,
        normalizer: Arc<Normalizer>,
        listener: Arc<dyn SourceListener>,
    ) -> Self {
        Self {
            transport,
            selector,
            baud_rate: DEFAULT_BAUD_RATE,
            normalizer,
            status: Arc::new(StatusCell::new(listener)),
            reader: None,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn port(&self) -> Option<&str> {
        self.reader.as_ref().map(|task| task.port.as_str())
    }

    async fn open_port(&self) -> Result<(String, ChunkReceiver), SourceError> {
        let transport = Arc::clone(&self.transport);
        let selector = Arc::clone(&self.selector);
        let baud_rate = self.baud_rate;

        // Enumeration, the selection prompt and the open call all block.
        tokio::task::spawn_blocking(move || {
            let ports = transport.list_ports()?;
            let port = selector
                .select(&ports)
                .ok_or(SourceError::UserCancelled)?;
            let chunks = transport.open(&port, baud_rate)?;
            Ok((port, chunks))
        })
        .await
        .map_err(|err| SourceError::TransportOpenFailed {
            port: String::new(),
            reason: format!("port open worker failed: {err}"),
        })?
    }

    /// Join a task that already ended on its own and left the status at
    /// `disconnected`.
    async fn reap_ended(&mut self) {
        if self.status.current() != ConnectionStatus::Disconnected {
            return;
        }
        if let Some(task) = self.reader.take() {
            task.cancel_token.cancel();
            let _ = task.handle.await;
        }
    }
}

impl DataSource for SerialAdapter {
    async fn connect(&mut self) -> Result<(), SourceError> {
        self.reap_ended().await;

        let current = self.status.current();
        if self.reader.is_some() || current != ConnectionStatus::Disconnected {
            return Err(SourceError::AlreadyConnected(current));
        }

        self.status.transition(ConnectionStatus::Connecting);

        let (port, chunks) = match self.open_port().await {
            Ok(opened) => opened,
            Err(err) => {
                if err.is_benign() {
                    log_info!("serial port selection cancelled");
                } else {
                    log_error!("failed to connect serial device: {err}");
                }
                self.status.transition(ConnectionStatus::Disconnected);
                return Err(err);
            }
        };

        log_info!("serial device {port} open at {} baud", self.baud_rate);

        // Connected before the loop starts, so an immediate unplug still
        // lands on `disconnected`.
        self.status.transition(ConnectionStatus::Connected);

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(read_loop(
            port.clone(),
            chunks,
            Arc::clone(&self.normalizer),
            Arc::clone(&self.status),
            cancel_token.clone(),
        ));

        self.reader = Some(ReadTask {
            port,
            handle,
            cancel_token,
        });
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.reader.take() {
            task.cancel_token.cancel();
            if let Err(err) = task.handle.await {
                log_error!("serial read loop for {} failed to join: {err}", task.port);
            }
            log_info!("serial device {} released", task.port);
        }
        self.status.transition(ConnectionStatus::Disconnected);
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn describe(&self) -> String {
        match self.port() {
            Some(port) => format!("serial {port} @ {} baud", self.baud_rate),
            None => format!("serial @ {} baud", self.baud_rate),
        }
    }
}

impl Drop for SerialAdapter {
    fn drop(&mut self) {
        if let Some(task) = &self.reader {
            task.cancel_token.cancel();
        }
    }
}

async fn read_loop(
    port: String,
    mut chunks: ChunkReceiver,
    normalizer: Arc<Normalizer>,
    status: Arc<StatusCell>,
    cancel_token: CancellationToken,
) {
    let listener = Arc::clone(status.listener());
    let mut framer = LineFramer::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                // disconnect() owns the status transition on this path.
                return;
            }
            chunk = chunks.recv() => match chunk {
                Some(Ok(bytes)) => {
                    for frame in framer.push(&bytes) {
                        let line = match frame {
                            Ok(line) => line,
                            Err(reason) => {
                                log_warn!("dropping frame from {port}: {reason}");
                                continue;
                            }
                        };
                        match normalizer.normalize_line(&line) {
                            Ok(reading) => {
                                log_debug!("frame from {port}: {line}");
                                listener.on_reading(reading);
                            }
                            Err(reason) => log_warn!("dropping frame from {port} ({reason}): {line}"),
                        }
                    }
                }
                Some(Err(err)) => {
                    let err = SourceError::ReadError(err.to_string());
                    log_error!("serial device {port}: {err}");
                    break;
                }
                None => {
                    log_warn!("serial device {port} disconnected");
                    break;
                }
            }
        }
    }

    status.transition(ConnectionStatus::Disconnected);
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::readings::{ChannelSchema, ChannelTable, AIR_QUALITY};
    use crate::source::transport::FixedPort;
    use crate::source::{event_channel, SourceEvent};

    type DeviceTx = mpsc::Sender<io::Result<Vec<u8>>>;

    /// Transport that hands out one pre-built channel per `open`.
    struct ScriptedTransport {
        ports: Result<Vec<String>, SourceError>,
        pending: Mutex<Vec<ChunkReceiver>>,
    }

    impl ScriptedTransport {
        fn with_device() -> (Arc<Self>, DeviceTx) {
            let (tx, rx) = mpsc::channel(16);
            let transport = Arc::new(Self {
                ports: Ok(vec!["/dev/ttyTEST".to_string()]),
                pending: Mutex::new(vec![rx]),
            });
            (transport, tx)
        }
    }

    impl SerialTransport for ScriptedTransport {
        fn list_ports(&self) -> Result<Vec<String>, SourceError> {
            self.ports.clone()
        }

        fn open(&self, port: &str, _baud_rate: u32) -> Result<ChunkReceiver, SourceError> {
            self.pending
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| SourceError::TransportOpenFailed {
                    port: port.to_string(),
                    reason: "device busy".to_string(),
                })
        }
    }

    struct Cancelling;

    impl PortSelector for Cancelling {
        fn select(&self, _available: &[String]) -> Option<String> {
            None
        }
    }

    fn adapter(
        transport: Arc<dyn SerialTransport>,
        selector: Arc<dyn PortSelector>,
    ) -> (SerialAdapter, mpsc::UnboundedReceiver<SourceEvent>) {
        let (listener, events) = event_channel();
        let normalizer = Arc::new(Normalizer::new(ChannelTable::for_schema(ChannelSchema::V2)));
        (SerialAdapter::new(transport, selector, normalizer, listener), events)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SourceEvent>) -> SourceEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for source event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn malformed_lines_do_not_stop_the_loop() {
        let (transport, device) = ScriptedTransport::with_device();
        let (mut adapter, mut events) = adapter(transport, Arc::new(FixedPort("/dev/ttyTEST".into())));

        adapter.connect().await.unwrap();
        assert_eq!(next_event(&mut events).await, SourceEvent::Status(ConnectionStatus::Connecting));
        assert_eq!(next_event(&mut events).await, SourceEvent::Status(ConnectionStatus::Connected));

        device
            .send(Ok(b"garbage\n{\"air_quality\":\"high\"}\n{\"mq135\":150,\"mq7\":5,\"mq3\":10}\n".to_vec()))
            .await
            .unwrap();

        match next_event(&mut events).await {
            SourceEvent::Reading(reading) => assert_eq!(reading.value(AIR_QUALITY), Some(150.0)),
            other => panic!("expected a reading, got {other:?}"),
        }
        assert_eq!(*adapter.status().borrow(), ConnectionStatus::Connected);

        adapter.disconnect().await;
    }

    #[tokio::test]
    async fn unplug_reports_disconnected_once() {
        let (transport, device) = ScriptedTransport::with_device();
        let (mut adapter, mut events) = adapter(transport, Arc::new(FixedPort("/dev/ttyTEST".into())));

        adapter.connect().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        drop(device);
        assert_eq!(
            next_event(&mut events).await,
            SourceEvent::Status(ConnectionStatus::Disconnected)
        );

        // The user pressing disconnect afterwards converges on the same state.
        adapter.disconnect().await;
        adapter.disconnect().await;
        assert!(events.try_recv().is_err());
        assert_eq!(*adapter.status().borrow(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn read_error_ends_the_connection() {
        let (transport, device) = ScriptedTransport::with_device();
        let (mut adapter, mut events) = adapter(transport, Arc::new(FixedPort("/dev/ttyTEST".into())));

        adapter.connect().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        device
            .send(Err(io::Error::new(io::ErrorKind::BrokenPipe, "device reset")))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            SourceEvent::Status(ConnectionStatus::Disconnected)
        );
    }

    #[tokio::test]
    async fn disconnect_twice_notifies_once_and_stops_delivery() {
        let (transport, device) = ScriptedTransport::with_device();
        let (mut adapter, mut events) = adapter(transport, Arc::new(FixedPort("/dev/ttyTEST".into())));

        adapter.connect().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        adapter.disconnect().await;
        adapter.disconnect().await;

        assert_eq!(
            next_event(&mut events).await,
            SourceEvent::Status(ConnectionStatus::Disconnected)
        );
        assert!(events.try_recv().is_err());

        // The port is released: the device side sees the receiver gone.
        assert!(device.send(Ok(b"{\"mq135\":1,\"mq7\":1,\"mq3\":1}\n".to_vec())).await.is_err());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelled_selection_is_benign() {
        let (transport, _device) = ScriptedTransport::with_device();
        let (mut adapter, mut events) = adapter(transport, Arc::new(Cancelling));

        let err = adapter.connect().await.unwrap_err();
        assert_eq!(err, SourceError::UserCancelled);
        assert!(err.is_benign());
        assert_eq!(next_event(&mut events).await, SourceEvent::Status(ConnectionStatus::Connecting));
        assert_eq!(next_event(&mut events).await, SourceEvent::Status(ConnectionStatus::Disconnected));
    }

    #[tokio::test]
    async fn missing_serial_support_is_surfaced() {
        let transport = Arc::new(ScriptedTransport {
            ports: Err(SourceError::UnsupportedEnvironment("no serial subsystem".into())),
            pending: Mutex::new(Vec::new()),
        });
        let (mut adapter, _events) = adapter(transport, Arc::new(FixedPort("/dev/ttyTEST".into())));

        let err = adapter.connect().await.unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedEnvironment(_)));
        assert!(!err.is_benign());
        assert_eq!(*adapter.status().borrow(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn open_failure_is_surfaced_and_retryable() {
        let (transport, _device) = ScriptedTransport::with_device();
        let (mut adapter, _events) = adapter(transport, Arc::new(FixedPort("/dev/ttyTEST".into())));

        adapter.connect().await.unwrap();
        assert!(matches!(
            adapter.connect().await,
            Err(SourceError::AlreadyConnected(ConnectionStatus::Connected))
        ));
        adapter.disconnect().await;

        // The scripted device was consumed by the first open.
        let err = adapter.connect().await.unwrap_err();
        assert!(matches!(err, SourceError::TransportOpenFailed { .. }));
        assert_eq!(*adapter.status().borrow(), ConnectionStatus::Disconnected);
    }
}
