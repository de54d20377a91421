//! Channel tables: which numeric channels a reading must carry and which
//! hardware-specific field names map onto them.
//!
//! Three schema variants have shipped over the life of the station firmware.
//! They differ only in channel set and field naming, so each one is a
//! `ChannelTable` rather than a separate parsing path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const AIR_QUALITY: &str = "air_quality";
pub const CO: &str = "co";
pub const ALCOHOL: &str = "alcohol";
pub const TEMPERATURE: &str = "temperature";
pub const HUMIDITY: &str = "humidity";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSchema {
    /// Serial station: all five channels under their canonical names.
    #[default]
    V1,
    /// Gas-only station: MQ sensors, reported under their part numbers.
    V2,
    /// Cloud station: all five channels, short hardware names.
    V3,
}

impl ChannelSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelSchema::V1 => "v1",
            ChannelSchema::V2 => "v2",
            ChannelSchema::V3 => "v3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTable {
    channels: Vec<String>,
    /// alias -> canonical channel
    aliases: BTreeMap<String, String>,
}

impl ChannelTable {
    pub fn new<C, A>(channels: C, aliases: A) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        A: IntoIterator<Item = (String, String)>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            aliases: aliases.into_iter().collect(),
        }
    }

    pub fn for_schema(schema: ChannelSchema) -> Self {
        let all = [AIR_QUALITY, CO, ALCOHOL, TEMPERATURE, HUMIDITY];
        let gas = [AIR_QUALITY, CO, ALCOHOL];
        let mq = [("mq135", AIR_QUALITY), ("mq7", CO), ("mq3", ALCOHOL)];

        match schema {
            ChannelSchema::V1 => Self::new(all, Vec::new()),
            ChannelSchema::V2 => Self::new(gas, owned_pairs(&mq)),
            ChannelSchema::V3 => {
                let mut aliases = owned_pairs(&mq);
                aliases.extend(owned_pairs(&[("temp", TEMPERATURE), ("hum", HUMIDITY)]));
                Self::new(all, aliases)
            }
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Alternate field names accepted for `channel`, in a stable order.
    pub fn aliases_for<'a>(&'a self, channel: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.aliases
            .iter()
            .filter(move |(_, canonical)| canonical.as_str() == channel)
            .map(|(alias, _)| alias.as_str())
    }

    pub fn canonical_for<'a>(&'a self, field: &'a str) -> Option<&'a str> {
        if self.channels.iter().any(|channel| channel == field) {
            return Some(field);
        }
        self.aliases.get(field).map(String::as_str)
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::for_schema(ChannelSchema::default())
    }
}

fn owned_pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(alias, canonical)| (alias.to_string(), canonical.to_string()))
        .collect()
}
