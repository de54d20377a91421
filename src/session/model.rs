use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::readings::SensorReading;

pub const DEFAULT_COMPLETION_COMMENT: &str = "Session completed.";

/// One monitoring run. Serializes to the export shape
/// `{id, startTime, endTime, comment, readings}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub readings: Vec<SensorReading>,
}

impl Session {
    /// Empty open session with a fresh id.
    pub fn open(start_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            start_time,
            end_time: None,
            comment: String::new(),
            readings: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.readings.last().map(|reading| reading.timestamp)
    }
}
