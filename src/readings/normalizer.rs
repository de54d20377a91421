use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{ChannelTable, SensorReading};

const TIMESTAMP_FIELD: &str = "timestamp";

/// Why a raw payload was not accepted as a reading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("missing channel '{0}'")]
    MissingField(String),
    #[error("channel '{0}' is not a finite number")]
    NotANumber(String),
    #[error("unparsable frame: {0}")]
    UnparsableFrame(String),
}

/// Maps decoded payloads onto the canonical reading shape of one channel table.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    table: ChannelTable,
}

impl Normalizer {
    pub fn new(table: ChannelTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ChannelTable {
        &self.table
    }

    /// Decode one text frame as JSON, then normalize it.
    pub fn normalize_line(&self, line: &str) -> Result<SensorReading, RejectReason> {
        let raw: Value = serde_json::from_str(line)
            .map_err(|err| RejectReason::UnparsableFrame(err.to_string()))?;
        self.normalize(&raw)
    }

    pub fn normalize(&self, raw: &Value) -> Result<SensorReading, RejectReason> {
        self.normalize_at(raw, Utc::now())
    }

    /// `now` stands in for the wall clock when the payload carries no timestamp.
    pub fn normalize_at(
        &self,
        raw: &Value,
        now: DateTime<Utc>,
    ) -> Result<SensorReading, RejectReason> {
        let object = raw.as_object().ok_or_else(|| {
            RejectReason::UnparsableFrame(format!("expected a JSON object, got {}", kind_of(raw)))
        })?;

        let timestamp = match object.get(TIMESTAMP_FIELD) {
            None | Some(Value::Null) => now,
            Some(Value::String(text)) if text.trim().is_empty() => now,
            Some(Value::String(text)) => DateTime::parse_from_rfc3339(text.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| {
                    RejectReason::UnparsableFrame(format!("invalid timestamp '{text}': {err}"))
                })?,
            Some(other) => {
                return Err(RejectReason::UnparsableFrame(format!(
                    "timestamp must be an ISO-8601 string, got {}",
                    kind_of(other)
                )))
            }
        };

        let mut channels = BTreeMap::new();
        for channel in self.table.channels() {
            // The canonical name wins over any alias carried in the same payload.
            let value = object.get(channel.as_str()).or_else(|| {
                self.table
                    .aliases_for(channel)
                    .find_map(|alias| object.get(alias))
            });

            let value = value.ok_or_else(|| RejectReason::MissingField(channel.clone()))?;
            let number = value
                .as_f64()
                .filter(|number| number.is_finite())
                .ok_or_else(|| RejectReason::NotANumber(channel.clone()))?;

            channels.insert(channel.clone(), number);
        }

        Ok(SensorReading::new(timestamp, channels))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::readings::{ChannelSchema, AIR_QUALITY, ALCOHOL, CO, HUMIDITY, TEMPERATURE};

    fn gas_only() -> Normalizer {
        Normalizer::new(ChannelTable::for_schema(ChannelSchema::V2))
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn maps_hardware_names_and_synthesizes_timestamp() {
        let raw = json!({"mq135": 150, "mq7": 5, "mq3": 10});
        let reading = gas_only().normalize_at(&raw, fixed_now()).unwrap();

        assert_eq!(reading.timestamp, fixed_now());
        assert_eq!(reading.value(AIR_QUALITY), Some(150.0));
        assert_eq!(reading.value(CO), Some(5.0));
        assert_eq!(reading.value(ALCOHOL), Some(10.0));
        assert_eq!(reading.channels.len(), 3);
    }

    #[test]
    fn keeps_supplied_timestamp() {
        let raw = json!({
            "timestamp": "2024-05-01T10:15:30.250Z",
            "air_quality": 180.5, "co": 4, "alcohol": 9,
        });
        let reading = gas_only().normalize_at(&raw, fixed_now()).unwrap();
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 30).unwrap()
                + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn string_value_is_not_a_number() {
        let normalizer = Normalizer::new(ChannelTable::for_schema(ChannelSchema::V1));
        let err = normalizer
            .normalize_line(r#"{"air_quality":"high"}"#)
            .unwrap_err();
        assert_eq!(err, RejectReason::NotANumber(AIR_QUALITY.to_string()));
    }

    #[test]
    fn null_and_boolean_values_are_rejected() {
        let err = gas_only()
            .normalize(&json!({"air_quality": 100, "co": null, "alcohol": 1}))
            .unwrap_err();
        assert_eq!(err, RejectReason::NotANumber(CO.to_string()));

        let err = gas_only()
            .normalize(&json!({"air_quality": 100, "co": 1, "alcohol": true}))
            .unwrap_err();
        assert_eq!(err, RejectReason::NotANumber(ALCOHOL.to_string()));
    }

    #[test]
    fn missing_channel_rejects_whole_reading() {
        let normalizer = Normalizer::new(ChannelTable::for_schema(ChannelSchema::V1));
        let err = normalizer
            .normalize(&json!({"air_quality": 1, "co": 2, "alcohol": 3, "temperature": 21}))
            .unwrap_err();
        assert_eq!(err, RejectReason::MissingField(HUMIDITY.to_string()));
    }

    #[test]
    fn garbage_lines_are_unparsable() {
        let normalizer = gas_only();
        for line in ["{not json", "[1,2,3]", "42", "\"text\""] {
            assert!(
                matches!(normalizer.normalize_line(line), Err(RejectReason::UnparsableFrame(_))),
                "line {line:?} should be unparsable"
            );
        }
    }

    #[test]
    fn bad_timestamps_are_unparsable() {
        let normalizer = gas_only();
        let bad_text = json!({"timestamp": "yesterday", "mq135": 1, "mq7": 1, "mq3": 1});
        let bad_type = json!({"timestamp": 1714557600, "mq135": 1, "mq7": 1, "mq3": 1});
        assert!(matches!(
            normalizer.normalize(&bad_text),
            Err(RejectReason::UnparsableFrame(_))
        ));
        assert!(matches!(
            normalizer.normalize(&bad_type),
            Err(RejectReason::UnparsableFrame(_))
        ));
    }

    #[test]
    fn canonical_name_wins_over_alias() {
        let raw = json!({"air_quality": 300, "mq135": 999, "co": 1, "alcohol": 2});
        let reading = gas_only().normalize_at(&raw, fixed_now()).unwrap();
        assert_eq!(reading.value(AIR_QUALITY), Some(300.0));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let normalizer = Normalizer::new(ChannelTable::for_schema(ChannelSchema::V3));
        let raw = json!({
            "mq135": 120, "mq7": 3, "mq3": 8, "temp": 27.5, "hum": 61,
            "firmware": "1.4.2", "rssi": -70,
        });
        let reading = normalizer.normalize_at(&raw, fixed_now()).unwrap();
        assert_eq!(reading.value(TEMPERATURE), Some(27.5));
        assert_eq!(reading.value(HUMIDITY), Some(61.0));
        assert!(reading.value("rssi").is_none());
    }
}
