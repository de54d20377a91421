//! Read-only summaries over recorded sessions for history review.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::readings::AIR_QUALITY;
use crate::session::Session;

/// Air-quality value treated as 0% breath quality.
pub const BREATH_QUALITY_CEILING: f64 = 600.0;
pub const TREND_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AirQualityBand {
    Normal,
    Elevated,
    High,
}

impl AirQualityBand {
    pub fn classify(air_quality: f64) -> Self {
        if air_quality < 200.0 {
            AirQualityBand::Normal
        } else if air_quality <= 400.0 {
            AirQualityBand::Elevated
        } else {
            AirQualityBand::High
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AirQualityBand::Normal => "Normal breath quality",
            AirQualityBand::Elevated => "Slight elevation detected",
            AirQualityBand::High => "High impurity levels detected",
        }
    }
}

impl std::fmt::Display for AirQualityBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Mean of one channel across a session; 0 when there is nothing to average.
pub fn channel_average(session: &Session, channel: &str) -> f64 {
    let values: Vec<f64> = session
        .readings
        .iter()
        .filter_map(|reading| reading.value(channel))
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Percentage in `0..=100`.
pub fn breath_quality_index(air_quality: f64) -> f64 {
    (air_quality / BREATH_QUALITY_CEILING * 100.0).clamp(0.0, 100.0)
}

/// `None` while the session is still open.
pub fn session_duration_secs(session: &Session) -> Option<i64> {
    session
        .end_time
        .map(|end| (end - session.start_time).num_seconds())
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub reading_count: usize,
    pub averages: BTreeMap<String, f64>,
    pub air_quality_band: AirQualityBand,
    pub breath_quality_index: f64,
}

pub fn summarize(session: &Session) -> SessionSummary {
    let mut averages = BTreeMap::new();
    for reading in &session.readings {
        for channel in reading.channels.keys() {
            if !averages.contains_key(channel) {
                averages.insert(channel.clone(), channel_average(session, channel));
            }
        }
    }
    let air_quality = averages.get(AIR_QUALITY).copied().unwrap_or(0.0);

    SessionSummary {
        id: session.id.clone(),
        start_time: session.start_time,
        end_time: session.end_time,
        duration_secs: session_duration_secs(session),
        reading_count: session.readings.len(),
        averages,
        air_quality_band: AirQualityBand::classify(air_quality),
        breath_quality_index: breath_quality_index(air_quality),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub air_quality: f64,
}

/// Average air quality of the latest sessions, oldest first. Expects the
/// newest-first order history stores return.
pub fn air_quality_trend(sessions: &[Session]) -> Vec<TrendPoint> {
    let mut points: Vec<TrendPoint> = sessions
        .iter()
        .take(TREND_WINDOW)
        .map(|session| TrendPoint {
            session_id: session.id.clone(),
            start_time: session.start_time,
            air_quality: channel_average(session, AIR_QUALITY),
        })
        .collect();
    points.reverse();
    points
}
