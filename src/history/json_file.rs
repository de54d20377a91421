use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};

use super::{newest_first, HistoryStore};
use crate::session::Session;

/// Owner key to that owner's sessions, in save order.
type HistoryFile = BTreeMap<String, Vec<Session>>;

/// History in a single pretty-printed JSON file, replaced on every change.
pub struct JsonFileHistoryStore {
    path: PathBuf,
    data: RwLock<HistoryFile>,
}

impl JsonFileHistoryStore {
    /// A missing file starts empty. A file that does not parse is an error
    /// rather than silently replaced.
    pub fn open(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read history from {}", path.display()))?;
            if contents.trim().is_empty() {
                HistoryFile::new()
            } else {
                serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse history in {}", path.display()))?
            }
        } else {
            HistoryFile::new()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, HistoryFile> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HistoryFile> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, data: &HistoryFile) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        // Readers only ever see the old file or the complete new one.
        let staging = self.staging_path();
        fs::write(&staging, serialized)
            .with_context(|| format!("Failed to write history to {}", staging.display()))?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("Failed to replace history at {}", self.path.display()))
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Apply `change` and write the file; memory is left untouched if the
    /// write fails.
    fn update<T>(&self, change: impl FnOnce(&mut HistoryFile) -> T) -> Result<T> {
        let mut guard = self.write();
        let mut next = guard.clone();
        let result = change(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(result)
    }
}

impl HistoryStore for JsonFileHistoryStore {
    async fn save(&self, owner_key: &str, session: &Session) -> Result<String> {
        self.update(|data| {
            let owned = data.entry(owner_key.to_string()).or_default();
            owned.retain(|existing| existing.id != session.id);
            owned.push(session.clone());
        })?;
        Ok(session.id.clone())
    }

    async fn list(&self, owner_key: &str) -> Result<Vec<Session>> {
        Ok(newest_first(
            self.read().get(owner_key).cloned().unwrap_or_default(),
        ))
    }

    async fn clear(&self, owner_key: &str) -> Result<()> {
        self.update(|data| {
            data.remove(owner_key);
        })
    }

    async fn get(&self, owner_key: &str, session_id: &str) -> Result<Option<Session>> {
        Ok(self
            .read()
            .get(owner_key)
            .and_then(|owned| owned.iter().find(|s| s.id == session_id).cloned()))
    }

    async fn delete(&self, owner_key: &str, session_id: &str) -> Result<bool> {
        self.update(|data| match data.get_mut(owner_key) {
            Some(owned) => {
                let before = owned.len();
                owned.retain(|s| s.id != session_id);
                owned.len() != before
            }
            None => false,
        })
    }
}
