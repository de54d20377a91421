use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::live_buffer::LiveBuffer;
use super::model::{Session, DEFAULT_COMPLETION_COMMENT};
use crate::history::HistoryStore;
use crate::readings::SensorReading;
use crate::source::ConnectionStatus;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("monitoring needs a connected data source (currently {0})")]
    PreconditionViolation(ConnectionStatus),
    #[error("session {0} is already active")]
    AlreadyActive(String),
    #[error("reading at {reading} is earlier than the last recorded reading at {last}")]
    OutOfOrder {
        reading: DateTime<Utc>,
        last: DateTime<Utc>,
    },
    #[error("failed to save session {id}: {error:#}")]
    Persist { id: String, error: anyhow::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    Idle,
    /// The session had no readings and was dropped.
    Discarded { id: String },
    Persisted { id: String, readings: usize },
}

/// `idle --start--> active --stop--> idle`.
///
/// Owns the live buffer and the open session so one `&mut self` call updates
/// both.
pub struct SessionManager<S: HistoryStore> {
    store: Arc<S>,
    owner_key: String,
    source_status: watch::Receiver<ConnectionStatus>,
    buffer: LiveBuffer,
    active: Option<Session>,
    sessions: Vec<Session>,
}

impl<S: HistoryStore> SessionManager<S> {
    pub fn new(
        store: Arc<S>,
        owner_key: impl Into<String>,
        source_status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        Self {
            store,
            owner_key: owner_key.into(),
            source_status,
            buffer: LiveBuffer::new(),
            active: None,
            sessions: Vec::new(),
        }
    }

    pub fn owner_key(&self) -> &str {
        &self.owner_key
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn start(&mut self) -> Result<&Session, SessionError> {
        self.start_at(Utc::now())
    }

    pub fn start_at(&mut self, start_time: DateTime<Utc>) -> Result<&Session, SessionError> {
        let status = *self.source_status.borrow();
        if status != ConnectionStatus::Connected {
            return Err(SessionError::PreconditionViolation(status));
        }
        if let Some(active) = &self.active {
            return Err(SessionError::AlreadyActive(active.id.clone()));
        }

        self.buffer.clear();
        let session = self.active.insert(Session::open(start_time));
        log_info!("session {} started", session.id);
        Ok(session)
    }

    /// Returns whether the reading went into an open session. While idle the
    /// reading only feeds the live buffer.
    pub fn record_reading(&mut self, reading: SensorReading) -> Result<bool, SessionError> {
        let Some(session) = self.active.as_mut() else {
            self.buffer.push(reading);
            return Ok(false);
        };

        if let Some(last) = session.last_timestamp() {
            if reading.timestamp < last {
                return Err(SessionError::OutOfOrder {
                    reading: reading.timestamp,
                    last,
                });
            }
        }

        self.buffer.push(reading.clone());
        session.readings.push(reading);
        Ok(true)
    }

    pub async fn stop(&mut self) -> Result<StopOutcome, SessionError> {
        self.stop_at(Utc::now()).await
    }

    pub async fn stop_at(&mut self, end_time: DateTime<Utc>) -> Result<StopOutcome, SessionError> {
        let Some(mut session) = self.active.take() else {
            return Ok(StopOutcome::Idle);
        };
        session.end_time = Some(end_time);

        if session.readings.is_empty() {
            log_info!("session {} ended without readings; discarded", session.id);
            return Ok(StopOutcome::Discarded { id: session.id });
        }

        if session.comment.is_empty() {
            session.comment = DEFAULT_COMPLETION_COMMENT.to_string();
        }
        let readings = session.readings.len();

        let id = match self.store.save(&self.owner_key, &session).await {
            Ok(id) => id,
            Err(error) => {
                log_error!(
                    "session {} with {readings} readings was not saved: {error:#}",
                    session.id
                );
                return Err(SessionError::Persist {
                    id: session.id,
                    error,
                });
            }
        };
        log_info!("session {id} saved with {readings} readings");

        if let Err(err) = self.refresh_sessions().await {
            log_warn!("failed to reload session history: {err:#}");
        }

        Ok(StopOutcome::Persisted { id, readings })
    }

    pub async fn refresh_sessions(&mut self) -> anyhow::Result<&[Session]> {
        self.sessions = self.store.list(&self.owner_key).await?;
        Ok(&self.sessions)
    }

    pub async fn clear_history(&mut self) -> anyhow::Result<()> {
        self.store.clear(&self.owner_key).await?;
        self.sessions.clear();
        log_info!("history cleared for owner {}", self.owner_key);
        Ok(())
    }

    /// Cached history, newest first, as of the last refresh.
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn live_buffer(&self) -> &LiveBuffer {
        &self.buffer
    }

    pub fn live_snapshot(&self) -> Vec<SensorReading> {
        self.buffer.snapshot()
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active.as_ref()
    }

    pub fn reading_count(&self) -> usize {
        self.active.as_ref().map_or(0, |session| session.readings.len())
    }
}
