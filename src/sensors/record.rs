//! rtl_433 `Honeywell-Security` telemetry records.
//!
//! rtl_433 publishes one JSON object per decoded transmission, e.g.
//!
//! ```text
//! {"time":"1700000000","model":"Honeywell-Security","id":980740,"channel":8,
//!  "event":128,"state":"open","contact_open":1,"reed_open":0,"alarm":0,
//!  "tamper":0,"battery_ok":1,"heartbeat":0,"mic":"CRC"}
//! ```
//!
//! Every field except `id` may be absent. Flags arrive as `0|1` but JSON
//! booleans are accepted too.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Deserializer};

/// Model string rtl_433 reports for Honeywell 345 MHz security sensors.
pub const HONEYWELL_MODEL: &str = "Honeywell-Security";

/// Largest serial a Honeywell sensor can carry.
pub const MAX_SENSOR_ID: u32 = 9_999_999;

/// One parsed telemetry record. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SensorRecord {
    #[serde(default, deserialize_with = "time_field")]
    pub time: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub id: u32,
    #[serde(default)]
    pub channel: Option<i64>,
    #[serde(default, rename = "event")]
    pub event_code: Option<i64>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub contact_open: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub reed_open: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub alarm: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub tamper: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub battery_ok: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub heartbeat: Option<bool>,
    #[serde(default)]
    pub mic: Option<String>,
}

impl SensorRecord {
    /// Parse and validate one inbound payload.
    pub fn parse(payload: &str) -> Result<Self> {
        let record: SensorRecord =
            serde_json::from_str(payload).map_err(|e| BridgeError::Parse(e.to_string()))?;
        if record.id == 0 || record.id > MAX_SENSOR_ID {
            return Err(BridgeError::Parse(format!(
                "sensor id {} outside 1..={}",
                record.id, MAX_SENSOR_ID
            )));
        }
        Ok(record)
    }

    /// True unless the record names a model other than Honeywell-Security.
    pub fn is_honeywell(&self) -> bool {
        self.model.as_deref().is_none_or(|m| m == HONEYWELL_MODEL)
    }

    /// Epoch seconds from `time`, when rtl_433 was configured for unix time.
    pub fn timestamp(&self) -> Option<i64> {
        self.time.as_deref().and_then(|t| t.trim().parse().ok())
    }
}

fn flag<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(Option::<Flag>::deserialize(deserializer)?.map(|f| match f {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    }))
}

fn time_field<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Time {
        Text(String),
        Epoch(i64),
    }

    Ok(Option::<Time>::deserialize(deserializer)?.map(|t| match t {
        Time::Text(s) => s,
        Time::Epoch(n) => n.to_string(),
    }))
}
