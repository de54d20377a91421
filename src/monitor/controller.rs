use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::history::HistoryStore;
use crate::readings::SensorReading;
use crate::session::{Session, SessionError, SessionManager, StopOutcome};
use crate::source::{ConnectionStatus, DataSource, SourceError, SourceEvent, SourceListener};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const NOTICE_CAPACITY: usize = 256;

/// What the monitor reports to whoever renders it.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorNotice {
    StatusChanged(ConnectionStatus),
    /// A reading reached the live buffer (and the open session, if any).
    Reading(SensorReading),
    SessionStarted { id: String },
    SessionFinished(StopOutcome),
    /// The session ended but could not be saved.
    SessionLost { id: String, reason: String },
}

enum PumpMessage {
    Source(SourceEvent),
    Flush(oneshot::Sender<()>),
}

struct ChannelListener {
    tx: mpsc::UnboundedSender<PumpMessage>,
}

impl SourceListener for ChannelListener {
    fn on_reading(&self, reading: SensorReading) {
        let _ = self.tx.send(PumpMessage::Source(SourceEvent::Reading(reading)));
    }

    fn on_status_change(&self, status: ConnectionStatus) {
        let _ = self.tx.send(PumpMessage::Source(SourceEvent::Status(status)));
    }
}

/// One data source wired to one session manager.
///
/// Source events are applied in emit order on a single pump task. Commands
/// flush the pump first, so a `stop()` sees every reading emitted before it.
/// A source dropping to `disconnected` mid-session ends the session as if
/// `stop()` had been called.
pub struct Monitor<D: DataSource, S: HistoryStore> {
    source: Mutex<D>,
    manager: Arc<Mutex<SessionManager<S>>>,
    status: watch::Receiver<ConnectionStatus>,
    pump_tx: mpsc::UnboundedSender<PumpMessage>,
    notices: broadcast::Sender<MonitorNotice>,
    pump: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl<D: DataSource, S: HistoryStore> Monitor<D, S> {
    /// `build_source` receives the listener the source must report to.
    pub fn new<F>(build_source: F, store: Arc<S>, owner_key: impl Into<String>) -> Self
    where
        F: FnOnce(Arc<dyn SourceListener>) -> D,
    {
        let (pump_tx, pump_rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn SourceListener> = Arc::new(ChannelListener {
            tx: pump_tx.clone(),
        });
        let source = build_source(listener);
        let status = source.status();

        let manager = Arc::new(Mutex::new(SessionManager::new(
            store,
            owner_key,
            status.clone(),
        )));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let cancel_token = CancellationToken::new();

        let pump = tokio::spawn(pump_events(
            pump_rx,
            Arc::clone(&manager),
            notices.clone(),
            cancel_token.clone(),
        ));

        Self {
            source: Mutex::new(source),
            manager,
            status,
            pump_tx,
            notices,
            pump: Some(pump),
            cancel_token,
        }
    }

    pub fn notices(&self) -> broadcast::Receiver<MonitorNotice> {
        self.notices.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub async fn describe_source(&self) -> String {
        self.source.lock().await.describe()
    }

    pub async fn connect(&self) -> Result<(), SourceError> {
        self.source.lock().await.connect().await
    }

    /// Waits out `connecting`; returns where the source settled.
    pub async fn wait_for_connection(&self) -> ConnectionStatus {
        let mut status = self.status.clone();
        let settled = match status
            .wait_for(|current| *current != ConnectionStatus::Connecting)
            .await
        {
            Ok(current) => *current,
            Err(_) => ConnectionStatus::Disconnected,
        };
        settled
    }

    /// Disconnects the source and waits until any session it was feeding has
    /// been finalized.
    pub async fn disconnect(&self) {
        self.source.lock().await.disconnect().await;
        self.flush().await;
    }

    /// Resolves once every event queued before the call has been applied.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.pump_tx.send(PumpMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub async fn start(&self) -> Result<String, SessionError> {
        self.flush().await;
        let id = self.manager.lock().await.start()?.id.clone();
        let _ = self.notices.send(MonitorNotice::SessionStarted { id: id.clone() });
        Ok(id)
    }

    pub async fn stop(&self) -> Result<StopOutcome, SessionError> {
        self.flush().await;
        let mut manager = self.manager.lock().await;
        finish_session(&mut manager, &self.notices).await
    }

    pub async fn live_snapshot(&self) -> Vec<SensorReading> {
        self.manager.lock().await.live_snapshot()
    }

    pub async fn active_session(&self) -> Option<Session> {
        self.manager.lock().await.active_session().cloned()
    }

    /// Cached history as of the last refresh.
    pub async fn sessions(&self) -> Vec<Session> {
        self.manager.lock().await.sessions().to_vec()
    }

    pub async fn refresh_sessions(&self) -> anyhow::Result<Vec<Session>> {
        let mut manager = self.manager.lock().await;
        Ok(manager.refresh_sessions().await?.to_vec())
    }

    pub async fn clear_history(&self) -> anyhow::Result<()> {
        self.manager.lock().await.clear_history().await
    }

    /// Ends an open session, disconnects the source and stops the pump.
    pub async fn shutdown(&mut self) -> Result<StopOutcome, SessionError> {
        let outcome = self.stop().await;
        self.disconnect().await;
        self.cancel_token.cancel();
        if let Some(pump) = self.pump.take() {
            if let Err(err) = pump.await {
                log_error!("monitor pump failed to join: {err}");
            }
        }
        outcome
    }
}

impl<D: DataSource, S: HistoryStore> Drop for Monitor<D, S> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn finish_session<S: HistoryStore>(
    manager: &mut SessionManager<S>,
    notices: &broadcast::Sender<MonitorNotice>,
) -> Result<StopOutcome, SessionError> {
    match manager.stop().await {
        Ok(StopOutcome::Idle) => Ok(StopOutcome::Idle),
        Ok(outcome) => {
            let _ = notices.send(MonitorNotice::SessionFinished(outcome.clone()));
            Ok(outcome)
        }
        Err(err) => {
            if let SessionError::Persist { id, .. } = &err {
                let _ = notices.send(MonitorNotice::SessionLost {
                    id: id.clone(),
                    reason: err.to_string(),
                });
            }
            Err(err)
        }
    }
}

async fn pump_events<S: HistoryStore>(
    mut rx: mpsc::UnboundedReceiver<PumpMessage>,
    manager: Arc<Mutex<SessionManager<S>>>,
    notices: broadcast::Sender<MonitorNotice>,
    cancel_token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        match message {
            PumpMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            PumpMessage::Source(SourceEvent::Reading(reading)) => {
                let recorded = manager.lock().await.record_reading(reading.clone());
                match recorded {
                    Ok(_) => {
                        let _ = notices.send(MonitorNotice::Reading(reading));
                    }
                    Err(err) => log_warn!("reading dropped: {err}"),
                }
            }
            PumpMessage::Source(SourceEvent::Status(status)) => {
                log_info!("data source {status}");
                let _ = notices.send(MonitorNotice::StatusChanged(status));
                if status != ConnectionStatus::Disconnected {
                    continue;
                }

                let mut manager = manager.lock().await;
                if manager.is_active() {
                    log_warn!("data source lost during a session; ending it");
                    if let Err(err) = finish_session(&mut manager, &notices).await {
                        log_error!("{err}");
                    }
                }
            }
        }
    }

    log_info!("monitor pump stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::history::MemoryHistoryStore;
    use crate::readings::{ChannelSchema, ChannelTable, Normalizer, AIR_QUALITY};
    use crate::source::simulated::{SimulatedTransport, SIMULATED_PORT};
    use crate::source::transport::FixedPort;
    use crate::source::SerialAdapter;

    fn simulated_monitor(
        interval_ms: u64,
        frame_limit: Option<usize>,
    ) -> (Monitor<SerialAdapter, MemoryHistoryStore>, Arc<MemoryHistoryStore>) {
        let store = Arc::new(MemoryHistoryStore::new());
        let mut transport =
            SimulatedTransport::new(Duration::from_millis(interval_ms)).with_seed(11);
        if let Some(limit) = frame_limit {
            transport = transport.with_frame_limit(limit);
        }
        let transport = Arc::new(transport);
        let monitor = Monitor::new(
            |listener| {
                SerialAdapter::new(
                    transport,
                    Arc::new(FixedPort(SIMULATED_PORT.into())),
                    Arc::new(Normalizer::new(ChannelTable::for_schema(ChannelSchema::V1))),
                    listener,
                )
            },
            Arc::clone(&store),
            "alice",
        );
        (monitor, store)
    }

    async fn wait_for<F>(notices: &mut broadcast::Receiver<MonitorNotice>, mut wanted: F) -> MonitorNotice
    where
        F: FnMut(&MonitorNotice) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                match notices.recv().await {
                    Ok(notice) if wanted(&notice) => return notice,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("notices closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for monitor notice")
    }

    #[tokio::test]
    async fn start_is_rejected_until_connected() {
        let (monitor, _store) = simulated_monitor(5, None);
        assert!(matches!(
            monitor.start().await,
            Err(SessionError::PreconditionViolation(ConnectionStatus::Disconnected))
        ));
    }

    #[tokio::test]
    async fn records_between_start_and_stop() {
        let (monitor, store) = simulated_monitor(5, None);

        monitor.connect().await.unwrap();
        assert_eq!(monitor.wait_for_connection().await, ConnectionStatus::Connected);
        monitor.start().await.unwrap();
        let mut notices = monitor.notices();

        for _ in 0..3 {
            wait_for(&mut notices, |n| matches!(n, MonitorNotice::Reading(_))).await;
        }

        let outcome = monitor.stop().await.unwrap();
        let StopOutcome::Persisted { id, readings } = outcome else {
            panic!("expected a saved session");
        };
        assert!(readings >= 3);
        assert_eq!(store.save_count(), 1);

        let history = monitor.sessions().await;
        assert_eq!(history[0].id, id);
        assert_eq!(history[0].readings.len(), readings);
        assert!(history[0]
            .readings
            .iter()
            .all(|r| r.value(AIR_QUALITY).is_some()));

        monitor.disconnect().await;
        assert_eq!(monitor.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn unplug_ends_the_session() {
        let (monitor, store) = simulated_monitor(50, Some(4));
        let mut notices = monitor.notices();

        monitor.connect().await.unwrap();
        monitor.start().await.unwrap();

        let finished = wait_for(&mut notices, |n| matches!(n, MonitorNotice::SessionFinished(_))).await;
        assert!(matches!(
            finished,
            MonitorNotice::SessionFinished(StopOutcome::Persisted { .. })
        ));
        assert_eq!(monitor.status(), ConnectionStatus::Disconnected);
        assert!(monitor.active_session().await.is_none());
        assert_eq!(store.save_count(), 1);

        // Stopping afterwards is a no-op.
        assert_eq!(monitor.stop().await.unwrap(), StopOutcome::Idle);
    }

    #[tokio::test]
    async fn shutdown_saves_the_open_session() {
        let (mut monitor, store) = simulated_monitor(5, None);

        monitor.connect().await.unwrap();
        monitor.start().await.unwrap();
        let mut notices = monitor.notices();
        wait_for(&mut notices, |n| matches!(n, MonitorNotice::Reading(_))).await;

        let outcome = monitor.shutdown().await.unwrap();
        assert!(matches!(outcome, StopOutcome::Persisted { .. }));
        assert_eq!(store.save_count(), 1);
        assert_eq!(monitor.status(), ConnectionStatus::Disconnected);
    }
}
