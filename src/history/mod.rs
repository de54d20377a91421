//! Where finished sessions go.
//!
//! Every store partitions history by an opaque owner key and lists newest
//! first. `clear` followed by `list` is always empty.

pub mod json_file;
pub mod memory;
pub mod sqlite;

use std::future::Future;

use anyhow::Result;

use crate::session::Session;
use crate::settings::{HistoryBackend, HistorySettings};

pub use json_file::JsonFileHistoryStore;
pub use memory::MemoryHistoryStore;
pub use sqlite::SqliteHistoryStore;

pub trait HistoryStore: Send + Sync + 'static {
    /// Persist a finalized session; returns its id.
    fn save(&self, owner_key: &str, session: &Session) -> impl Future<Output = Result<String>> + Send;

    fn list(&self, owner_key: &str) -> impl Future<Output = Result<Vec<Session>>> + Send;

    fn clear(&self, owner_key: &str) -> impl Future<Output = Result<()>> + Send;

    fn get(
        &self,
        owner_key: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<Option<Session>>> + Send;

    /// Returns whether a session was removed.
    fn delete(&self, owner_key: &str, session_id: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// Store picked from settings at startup.
pub enum AnyHistoryStore {
    Sqlite(SqliteHistoryStore),
    Json(JsonFileHistoryStore),
    Memory(MemoryHistoryStore),
}

impl AnyHistoryStore {
    pub fn open(settings: &HistorySettings) -> Result<Self> {
        Ok(match settings.backend {
            HistoryBackend::Sqlite => {
                Self::Sqlite(SqliteHistoryStore::open(settings.resolved_path())?)
            }
            HistoryBackend::Json => {
                Self::Json(JsonFileHistoryStore::open(settings.resolved_path())?)
            }
            HistoryBackend::Memory => Self::Memory(MemoryHistoryStore::new()),
        })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Sqlite(store) => match store.path() {
                Some(path) => format!("sqlite {}", path.display()),
                None => "sqlite (in memory)".to_string(),
            },
            Self::Json(store) => format!("json {}", store.path().display()),
            Self::Memory(_) => "memory".to_string(),
        }
    }
}

impl HistoryStore for AnyHistoryStore {
    async fn save(&self, owner_key: &str, session: &Session) -> Result<String> {
        match self {
            Self::Sqlite(store) => store.save(owner_key, session).await,
            Self::Json(store) => store.save(owner_key, session).await,
            Self::Memory(store) => store.save(owner_key, session).await,
        }
    }

    async fn list(&self, owner_key: &str) -> Result<Vec<Session>> {
        match self {
            Self::Sqlite(store) => store.list(owner_key).await,
            Self::Json(store) => store.list(owner_key).await,
            Self::Memory(store) => store.list(owner_key).await,
        }
    }

    async fn clear(&self, owner_key: &str) -> Result<()> {
        match self {
            Self::Sqlite(store) => store.clear(owner_key).await,
            Self::Json(store) => store.clear(owner_key).await,
            Self::Memory(store) => store.clear(owner_key).await,
        }
    }

    async fn get(&self, owner_key: &str, session_id: &str) -> Result<Option<Session>> {
        match self {
            Self::Sqlite(store) => store.get(owner_key, session_id).await,
            Self::Json(store) => store.get(owner_key, session_id).await,
            Self::Memory(store) => store.get(owner_key, session_id).await,
        }
    }

    async fn delete(&self, owner_key: &str, session_id: &str) -> Result<bool> {
        match self {
            Self::Sqlite(store) => store.delete(owner_key, session_id).await,
            Self::Json(store) => store.delete(owner_key, session_id).await,
            Self::Memory(store) => store.delete(owner_key, session_id).await,
        }
    }
}

/// Newest first by start time; equal start times keep the later save first.
/// `sessions` must be in save order.
pub(crate) fn newest_first(mut sessions: Vec<Session>) -> Vec<Session> {
    sessions.reverse();
    sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    sessions
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every store must share.

    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::readings::{SensorReading, AIR_QUALITY, CO};
    use crate::session::DEFAULT_COMPLETION_COMMENT;

    pub fn finished_session(minute: u32, values: &[f64]) -> Session {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 10, minute, 0).unwrap()
            + Duration::nanoseconds(987_654_321);
        let mut session = Session::open(start);
        for (offset, value) in values.iter().enumerate() {
            session.readings.push(SensorReading::new(
                start + Duration::milliseconds(offset as i64 * 1500 + 1),
                BTreeMap::from([(AIR_QUALITY.to_string(), *value), (CO.to_string(), 5.0)]),
            ));
        }
        session.end_time = Some(start + Duration::seconds(30));
        session.comment = DEFAULT_COMPLETION_COMMENT.to_string();
        session
    }

    pub async fn exercise<S: HistoryStore>(store: &S) {
        let first = finished_session(0, &[150.0, 210.0, 430.0]);
        let second = finished_session(5, &[120.0]);
        let tie = finished_session(5, &[99.0]);

        assert_eq!(store.save("alice", &first).await.unwrap(), first.id);
        store.save("alice", &second).await.unwrap();
        store.save("alice", &tie).await.unwrap();
        store.save("bob", &finished_session(9, &[1.0])).await.unwrap();

        let listed = store.list("alice").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![tie.id.as_str(), second.id.as_str(), first.id.as_str()]);

        // Exact round trip, readings in arrival order.
        assert_eq!(listed[2], first);
        assert_eq!(store.get("alice", &first.id).await.unwrap(), Some(first.clone()));
        assert_eq!(store.get("bob", &first.id).await.unwrap(), None);

        // Ids are scoped per owner: reusing one under another owner leaves
        // this copy where it is.
        let mut reused = finished_session(7, &[42.0]);
        reused.id = first.id.clone();
        store.save("bob", &reused).await.unwrap();
        assert_eq!(store.get("alice", &first.id).await.unwrap(), Some(first.clone()));
        assert_eq!(store.get("bob", &first.id).await.unwrap(), Some(reused));

        assert!(store.delete("alice", &second.id).await.unwrap());
        assert!(!store.delete("alice", &second.id).await.unwrap());
        assert_eq!(store.list("alice").await.unwrap().len(), 2);

        store.clear("alice").await.unwrap();
        assert!(store.list("alice").await.unwrap().is_empty());
        assert_eq!(store.list("bob").await.unwrap().len(), 2);
    }
}
