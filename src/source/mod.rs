//! Data sources: where live readings come from.
//!
//! Every source follows the same state machine:
//!
//! ```text
//! disconnected --connect--> connecting --success--> connected
//! connected --(disconnect | transport failure | liveness loss)--> disconnected
//! ```
//!
//! There is no automatic reconnect; a dropped source stays `disconnected`
//! until `connect()` is called again.

pub mod framing;
pub mod realtime;
pub mod remote;
pub mod serial;
pub mod simulated;
pub mod status;
pub mod transport;

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::readings::SensorReading;

pub use remote::RemoteAdapter;
pub use serial::SerialAdapter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Reading(SensorReading),
    Status(ConnectionStatus),
}

/// Receives everything a source emits, in emit order.
///
/// Callbacks run on the source's delivery task and must not block.
pub trait SourceListener: Send + Sync + 'static {
    fn on_reading(&self, reading: SensorReading);
    fn on_status_change(&self, status: ConnectionStatus);
}

impl SourceListener for mpsc::UnboundedSender<SourceEvent> {
    fn on_reading(&self, reading: SensorReading) {
        let _ = self.send(SourceEvent::Reading(reading));
    }

    fn on_status_change(&self, status: ConnectionStatus) {
        let _ = self.send(SourceEvent::Status(status));
    }
}

/// Listener that forwards into an unbounded channel.
pub fn event_channel() -> (Arc<dyn SourceListener>, mpsc::UnboundedReceiver<SourceEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The user dismissed device selection. Not a failure.
    #[error("device selection was cancelled")]
    UserCancelled,
    #[error("serial access is not available in this environment: {0}")]
    UnsupportedEnvironment(String),
    #[error("failed to open {port}: {reason}")]
    TransportOpenFailed { port: String, reason: String },
    #[error("read from data source failed: {0}")]
    ReadError(String),
    #[error("subscription to '{path}' failed: {reason}")]
    StreamError { path: String, reason: String },
    #[error("data source is already {0}")]
    AlreadyConnected(ConnectionStatus),
}

impl SourceError {
    pub fn is_benign(&self) -> bool {
        matches!(self, SourceError::UserCancelled)
    }
}

pub trait DataSource: Send + 'static {
    /// Establish the source. Readings and status changes flow to the listener
    /// the source was built with.
    fn connect(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Tear the source down. Idempotent. Once this resolves the listener
    /// receives nothing further from the torn-down connection.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// Read-only view of the connection status.
    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    fn describe(&self) -> String;
}

/// Either kind of source, chosen at runtime from settings.
pub enum AnySource {
    Serial(SerialAdapter),
    Remote(RemoteAdapter),
}

impl DataSource for AnySource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        match self {
            AnySource::Serial(adapter) => adapter.connect().await,
            AnySource::Remote(adapter) => adapter.connect().await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            AnySource::Serial(adapter) => adapter.disconnect().await,
            AnySource::Remote(adapter) => adapter.disconnect().await,
        }
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        match self {
            AnySource::Serial(adapter) => adapter.status(),
            AnySource::Remote(adapter) => adapter.status(),
        }
    }

    fn describe(&self) -> String {
        match self {
            AnySource::Serial(adapter) => adapter.describe(),
            AnySource::Remote(adapter) => adapter.describe(),
        }
    }
}
