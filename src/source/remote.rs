use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::realtime::{RealtimeStore, Subscription};
use super::status::StatusCell;
use super::{ConnectionStatus, DataSource, SourceError, SourceListener};
use crate::readings::Normalizer;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub const DEFAULT_READINGS_PATH: &str = "voc_readings/latest";
pub const DEFAULT_LIVENESS_PATH: &str = ".info/connected";

struct PumpTask {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

/// Readings pushed by a realtime store.
///
/// Status follows the store's liveness flag, not data arrival: the adapter
/// sits in `connecting` until the flag reads `true`, and a later `false` (or
/// either stream ending) tears both subscriptions down.
pub struct RemoteAdapter {
    store: Arc<dyn RealtimeStore>,
    readings_path: String,
    liveness_path: String,
    normalizer: Arc<Normalizer>,
    status: Arc<StatusCell>,
    pump: Option<PumpTask>,
}

impl RemoteAdapter {
    pub fn new(
        store: Arc<dyn RealtimeStore>,
        normalizer: Arc<Normalizer>,
        listener: Arc<dyn SourceListener>,
    ) -> Self {
        Self {
            store,
            readings_path: DEFAULT_READINGS_PATH.to_string(),
            liveness_path: DEFAULT_LIVENESS_PATH.to_string(),
            normalizer,
            status: Arc::new(StatusCell::new(listener)),
            pump: None,
        }
    }

    pub fn with_paths(
        mut self,
        readings_path: impl Into<String>,
        liveness_path: impl Into<String>,
    ) -> Self {
        self.readings_path = readings_path.into();
        self.liveness_path = liveness_path.into();
        self
    }

    fn subscribe_both(&self) -> Result<(Subscription, Subscription), SourceError> {
        let readings = self.store.subscribe(&self.readings_path)?;
        // `readings` unsubscribes on drop if the second call fails.
        let liveness = self.store.subscribe(&self.liveness_path)?;
        Ok((readings, liveness))
    }

    /// Join a task that already ended on its own and left the status at
    /// `disconnected`.
    async fn reap_ended(&mut self) {
        if self.status.current() != ConnectionStatus::Disconnected {
            return;
        }
        if let Some(task) = self.pump.take() {
            task.cancel_token.cancel();
            let _ = task.handle.await;
        }
    }
}

impl DataSource for RemoteAdapter {
    async fn connect(&mut self) -> Result<(), SourceError> {
        self.reap_ended().await;

        let current = self.status.current();
        if self.pump.is_some() || current != ConnectionStatus::Disconnected {
            return Err(SourceError::AlreadyConnected(current));
        }

        self.status.transition(ConnectionStatus::Connecting);

        let (readings, liveness) = match self.subscribe_both() {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                log_warn!("remote subscription failed: {err}");
                self.status.transition(ConnectionStatus::Disconnected);
                return Err(err);
            }
        };

        log_info!(
            "subscribed to '{}' (liveness '{}')",
            self.readings_path,
            self.liveness_path
        );

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(pump(
            readings,
            liveness,
            Arc::clone(&self.normalizer),
            Arc::clone(&self.status),
            cancel_token.clone(),
        ));
        self.pump = Some(PumpTask {
            handle,
            cancel_token,
        });
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.pump.take() {
            task.cancel_token.cancel();
            if let Err(err) = task.handle.await {
                log_warn!("remote subscription task failed to join: {err}");
            }
            log_info!("unsubscribed from '{}'", self.readings_path);
        }
        self.status.transition(ConnectionStatus::Disconnected);
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn describe(&self) -> String {
        format!("remote '{}'", self.readings_path)
    }
}

impl Drop for RemoteAdapter {
    fn drop(&mut self) {
        if let Some(task) = &self.pump {
            task.cancel_token.cancel();
        }
    }
}

async fn pump(
    mut readings: Subscription,
    mut liveness: Subscription,
    normalizer: Arc<Normalizer>,
    status: Arc<StatusCell>,
    cancel_token: CancellationToken,
) {
    let listener = Arc::clone(status.listener());
    let deliver = |value: Value| match value {
        Value::Null => {}
        value => match normalizer.normalize(&value) {
            Ok(reading) => {
                log_debug!("snapshot: {value}");
                listener.on_reading(reading);
            }
            Err(reason) => log_warn!("dropping snapshot ({reason}): {value}"),
        },
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                readings.close().await;
                liveness.close().await;
                return;
            }
            snapshot = readings.next() => match snapshot {
                Some(value) => deliver(value),
                None => {
                    let err = SourceError::StreamError {
                        path: readings.path().to_string(),
                        reason: "stream ended".to_string(),
                    };
                    log_warn!("{err}");
                    break;
                }
            },
            alive = liveness.next() => match alive {
                Some(Value::Bool(true)) => {
                    if status.transition(ConnectionStatus::Connected) {
                        log_info!("remote store reachable");
                    }
                }
                Some(other) => {
                    // The first snapshot of the flag is usually `false`; only
                    // a drop after going live ends the connection.
                    if status.current() == ConnectionStatus::Connected {
                        log_warn!("remote store lost (liveness {other})");
                        break;
                    }
                }
                None => {
                    log_warn!("liveness stream for '{}' ended", liveness.path());
                    break;
                }
            },
        }
    }

    // Snapshots pushed before the store went away still count.
    while let Some(value) = readings.try_next() {
        deliver(value);
    }
    readings.close().await;
    liveness.close().await;
    status.transition(ConnectionStatus::Disconnected);
}
