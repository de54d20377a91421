use std::path::{Path, PathBuf};

use anyhow::Result;

use super::HistoryStore;
use crate::db::Database;
use crate::session::Session;

/// History in a local SQLite file.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    db: Database,
}

impl SqliteHistoryStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self::from_database(Database::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self { db }
    }

    pub fn path(&self) -> Option<&Path> {
        self.db.path()
    }
}

impl HistoryStore for SqliteHistoryStore {
    async fn save(&self, owner_key: &str, session: &Session) -> Result<String> {
        self.db.insert_session(owner_key, session).await?;
        Ok(session.id.clone())
    }

    async fn list(&self, owner_key: &str) -> Result<Vec<Session>> {
        self.db.list_sessions(owner_key).await
    }

    async fn clear(&self, owner_key: &str) -> Result<()> {
        self.db.clear_sessions(owner_key).await?;
        Ok(())
    }

    async fn get(&self, owner_key: &str, session_id: &str) -> Result<Option<Session>> {
        self.db.get_session(owner_key, session_id).await
    }

    async fn delete(&self, owner_key: &str, session_id: &str) -> Result<bool> {
        self.db.delete_session(owner_key, session_id).await
    }
}
