use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped multi-channel sample.
///
/// Serializes flat: `{"timestamp": "...", "air_quality": 150.0, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub channels: BTreeMap<String, f64>,
}

impl SensorReading {
    pub fn new(timestamp: DateTime<Utc>, channels: BTreeMap<String, f64>) -> Self {
        Self {
            timestamp,
            channels,
        }
    }

    pub fn value(&self, channel: &str) -> Option<f64> {
        self.channels.get(channel).copied()
    }
}
