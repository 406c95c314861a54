use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MalformedRecordError;

/// Avro schema of the station records published on the source topic.
/// Field order matches [`Station`].
pub const STATION_VALUE_SCHEMA: &str = r#"{
    "type": "record",
    "name": "station",
    "namespace": "com.cta.stations",
    "fields": [
        {"name": "stop_id", "type": "long"},
        {"name": "direction_id", "type": "string"},
        {"name": "stop_name", "type": "string"},
        {"name": "station_name", "type": "string"},
        {"name": "station_descriptive_name", "type": "string"},
        {"name": "station_id", "type": "long"},
        {"name": "order", "type": "long"},
        {"name": "red", "type": "boolean"},
        {"name": "blue", "type": "boolean"},
        {"name": "green", "type": "boolean"}
    ]
}"#;

pub const STATION_KEY_SCHEMA: &str = r#"{
    "type": "record",
    "name": "station_key",
    "namespace": "com.cta.stations",
    "fields": [{"name": "timestamp", "type": "long"}]
}"#;

/// Key of records on the source topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationKey {
    pub timestamp: i64,
}

/// A stop as published upstream. Exactly one of the line flags should be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub stop_id: i64,
    pub direction_id: String,
    pub stop_name: String,
    pub station_name: String,
    pub station_descriptive_name: String,
    pub station_id: i64,
    pub order: i64,
    pub red: bool,
    pub blue: bool,
    pub green: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Line {
    Blue,
    Green,
    Red,
}

impl Line {
    /// Blue wins over green, green over red.
    pub fn from_flags(blue: bool, green: bool, red: bool) -> Option<Self> {
        if blue {
            Some(Self::Blue)
        } else if green {
            Some(Self::Green)
        } else if red {
            Some(Self::Red)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Red => "red",
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl Station {
    pub fn line_flag_count(&self) -> usize { [self.blue, self.green, self.red].into_iter().filter(|set| *set).count() }

    /// Line by flag precedence. Stations with no flag are rejected.
    pub fn line(&self) -> Result<Line, MalformedRecordError> {
        Line::from_flags(self.blue, self.green, self.red).ok_or(MalformedRecordError::NoLine {
            stop_id: self.stop_id,
        })
    }

    /// Like [`Station::line`] but also rejects stations with more than one flag.
    pub fn strict_line(&self) -> Result<Line, MalformedRecordError> {
        match self.line_flag_count() {
            0 | 1 => self.line(),
            count => Err(MalformedRecordError::MultipleLines {
                stop_id: self.stop_id,
                count,
            }),
        }
    }
}

/// Value of the materialized table, keyed by `stop_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedStation {
    pub station_id: i64,
    pub station_name: String,
    pub order: i64,
    pub line: Line,
}

impl TransformedStation {
    pub fn from_station(station: &Station) -> Result<Self, MalformedRecordError> {
        Ok(Self {
            station_id: station.station_id,
            station_name: station.station_name.clone(),
            order: station.order,
            line: station.line()?,
        })
    }
}
