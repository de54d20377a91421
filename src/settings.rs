use anyhow::{Context, Result};
use clap::ValueEnum;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::readings::ChannelSchema;
use crate::source::remote::{DEFAULT_LIVENESS_PATH, DEFAULT_READINGS_PATH};
use crate::source::transport::DEFAULT_BAUD_RATE;

pub const SETTINGS_ENV: &str = "AIRWATCH_SETTINGS";
pub const PORT_ENV: &str = "AIRWATCH_PORT";
pub const OWNER_ENV: &str = "AIRWATCH_OWNER";
pub const DEFAULT_SETTINGS_FILE: &str = "airwatch.json";
pub const DEFAULT_OWNER_KEY: &str = "local";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Serial,
    Remote,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialSettings {
    /// Fixed device path. Unset means ask on the terminal.
    pub port: Option<String>,
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteSettings {
    /// Realtime database root, e.g. `https://<project>.firebaseio.com`.
    /// Unset runs against an in-process hub fed by the simulated station.
    pub base_url: Option<String>,
    pub readings_path: String,
    pub liveness_path: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            readings_path: DEFAULT_READINGS_PATH.into(),
            liveness_path: DEFAULT_LIVENESS_PATH.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Sqlite,
    Json,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HistorySettings {
    pub backend: HistoryBackend,
    pub path: Option<PathBuf>,
}

impl HistorySettings {
    pub fn resolved_path(&self) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(path), _) => path.clone(),
            (None, HistoryBackend::Json) => PathBuf::from("airwatch-data/history.json"),
            (None, _) => PathBuf::from("airwatch-data/history.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub source: SourceKind,
    pub serial: SerialSettings,
    pub channel_schema: ChannelSchema,
    pub remote: RemoteSettings,
    pub history: HistorySettings,
    pub owner_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            serial: SerialSettings::default(),
            channel_schema: ChannelSchema::default(),
            remote: RemoteSettings::default(),
            history: HistorySettings::default(),
            owner_key: DEFAULT_OWNER_KEY.into(),
        }
    }
}

impl Settings {
    /// Settings file location: `AIRWATCH_SETTINGS`, else `./airwatch.json`.
    pub fn default_path() -> PathBuf {
        std::env::var_os(SETTINGS_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE))
    }

    /// Never fails: a missing file gives defaults, a broken one gives
    /// defaults and a warning.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match read_settings(path) {
            Ok(settings) => settings,
            Err(err) => {
                warn!("ignoring settings file: {err:#}");
                Self::default()
            }
        }
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(PORT_ENV).ok(),
            std::env::var(OWNER_ENV).ok(),
        )
    }

    fn with_overrides(mut self, port: Option<String>, owner: Option<String>) -> Self {
        if let Some(port) = port.filter(|value| !value.trim().is_empty()) {
            self.serial.port = Some(port.trim().to_string());
        }
        if let Some(owner) = owner.filter(|value| !value.trim().is_empty()) {
            self.owner_key = owner.trim().to_string();
        }
        self
    }
}

fn read_settings(path: &Path) -> Result<Settings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse settings in {}", path.display()))
}

/// The settings file plus its on-disk location. Environment overrides are
/// applied on read and never written back.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        let data = Settings::load(&path);
        Self {
            path,
            data: RwLock::new(data),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, Settings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Settings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stored settings with environment overrides applied.
    pub fn effective(&self) -> Settings {
        self.read().clone().with_env_overrides()
    }

    pub fn update_owner_key(&self, owner_key: &str) -> Result<()> {
        let owner_key = owner_key.trim();
        if owner_key.is_empty() {
            anyhow::bail!("owner key must not be empty");
        }
        let mut guard = self.write();
        guard.owner_key = owner_key.to_string();
        self.persist(&guard)
    }

    pub fn update_source(&self, source: SourceKind) -> Result<()> {
        let mut guard = self.write();
        guard.source = source;
        self.persist(&guard)
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
