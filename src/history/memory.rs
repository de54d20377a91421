use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{bail, Result};
use tokio::sync::Mutex;

use super::{newest_first, HistoryStore};
use crate::session::Session;

/// In-process history, lost on exit.
#[derive(Default)]
pub struct MemoryHistoryStore {
    sessions: Mutex<HashMap<String, Vec<Session>>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every following `save` fail, to exercise error paths.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl HistoryStore for MemoryHistoryStore {
    async fn save(&self, owner_key: &str, session: &Session) -> Result<String> {
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("history store unavailable");
        }
        let mut sessions = self.sessions.lock().await;
        let owned = sessions.entry(owner_key.to_string()).or_default();
        owned.retain(|existing| existing.id != session.id);
        owned.push(session.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(session.id.clone())
    }

    async fn list(&self, owner_key: &str) -> Result<Vec<Session>> {
        let sessions = self.sessions.lock().await;
        Ok(newest_first(sessions.get(owner_key).cloned().unwrap_or_default()))
    }

    async fn clear(&self, owner_key: &str) -> Result<()> {
        self.sessions.lock().await.remove(owner_key);
        Ok(())
    }

    async fn get(&self, owner_key: &str, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .get(owner_key)
            .and_then(|owned| owned.iter().find(|s| s.id == session_id).cloned()))
    }

    async fn delete(&self, owner_key: &str, session_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        let Some(owned) = sessions.get_mut(owner_key) else {
            return Ok(false);
        };
        let before = owned.len();
        owned.retain(|s| s.id != session_id);
        Ok(owned.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::contract;

    #[tokio::test]
    async fn satisfies_store_contract() {
        let store = MemoryHistoryStore::new();
        contract::exercise(&store).await;
        assert_eq!(store.save_count(), 4);
    }

    #[tokio::test]
    async fn failing_saves_are_reported() {
        let store = MemoryHistoryStore::new();
        store.set_fail_saves(true);
        let session = contract::finished_session(1, &[150.0]);
        assert!(store.save("alice", &session).await.is_err());
        assert_eq!(store.save_count(), 0);
        assert!(store.list("alice").await.unwrap().is_empty());
    }
}
