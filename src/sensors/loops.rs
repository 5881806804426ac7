//! Loop selection for multi-purpose Honeywell sensors.
//!
//! A Honeywell 5800-series transmitter reports every sensing circuit in the
//! same packet. Which one carries the user-relevant state depends on how the
//! sensor is wired, so each logical device picks a loop:
//!
//! | Loop | Field          |
//! |------|----------------|
//! | 1    | `contact_open` |
//! | 2    | `reed_open`    |
//! | 3    | `alarm`        |
//!
//! Loop 4 (tamper) is reserved. Tamper is always surfaced as its own attribute.

use super::SensorKind;
use super::record::SensorRecord;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Loop {
    One,
    Two,
    Three,
}

impl Loop {
    /// Default loop by sensor kind: motion detectors trip the external
    /// contact, door/window contacts trip the internal reed switch.
    pub fn default_for(kind: SensorKind) -> Self {
        match kind {
            SensorKind::Motion => Loop::One,
            SensorKind::Contact => Loop::Two,
        }
    }

    /// Payload field this loop reads.
    pub fn field_name(self) -> &'static str {
        match self {
            Loop::One => "contact_open",
            Loop::Two => "reed_open",
            Loop::Three => "alarm",
        }
    }

    /// Select this loop's flag from `record`. An absent flag reads as inactive.
    pub fn resolve(self, record: &SensorRecord) -> bool {
        let field = match self {
            Loop::One => record.contact_open,
            Loop::Two => record.reed_open,
            Loop::Three => record.alarm,
        };
        field.unwrap_or(false)
    }
}

impl From<Loop> for u8 {
    fn from(l: Loop) -> Self {
        match l {
            Loop::One => 1,
            Loop::Two => 2,
            Loop::Three => 3,
        }
    }
}

impl TryFrom<u8> for Loop {
    type Error = BridgeError;

    fn try_from(n: u8) -> Result<Self> {
        match n {
            1 => Ok(Loop::One),
            2 => Ok(Loop::Two),
            3 => Ok(Loop::Three),
            4 => Err(BridgeError::Validation(
                "loop 4 (tamper) is reserved and cannot drive device state".to_string(),
            )),
            other => Err(BridgeError::Validation(format!(
                "unknown loop {}, expected 1, 2 or 3",
                other
            ))),
        }
    }
}

impl FromStr for Loop {
    type Err = BridgeError;

    /// Accepts `1`..`3` or `loop1`..`loop3` (case-insensitive).
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let digits = lower.strip_prefix("loop").unwrap_or(&lower).trim();
        let n: u8 = digits
            .parse()
            .map_err(|_| BridgeError::Validation(format!("unknown loop '{}'", s)))?;
        Loop::try_from(n)
    }
}

impl fmt::Display for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop {} ({})", u8::from(*self), self.field_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(contact: Option<bool>, reed: Option<bool>, alarm: Option<bool>) -> SensorRecord {
        SensorRecord {
            time: None,
            model: None,
            id: 1,
            channel: None,
            event_code: None,
            state: None,
            contact_open: contact,
            reed_open: reed,
            alarm,
            tamper: Some(true),
            battery_ok: None,
            heartbeat: None,
            mic: None,
        }
    }

    #[test]
    fn test_each_loop_reads_its_own_field() {
        let r = record(Some(true), Some(false), Some(false));
        assert!(Loop::One.resolve(&r));
        assert!(!Loop::Two.resolve(&r));
        assert!(!Loop::Three.resolve(&r));

        let r = record(Some(false), Some(true), Some(false));
        assert!(!Loop::One.resolve(&r));
        assert!(Loop::Two.resolve(&r));

        let r = record(Some(false), Some(false), Some(true));
        assert!(Loop::Three.resolve(&r));
    }

    #[test]
    fn test_resolve_is_total_on_partial_records() {
        let r = record(None, None, None);
        for l in [Loop::One, Loop::Two, Loop::Three] {
            assert!(!l.resolve(&r));
            // Deterministic
            assert_eq!(l.resolve(&r), l.resolve(&r));
        }
    }

    #[test]
    fn test_tamper_never_selected() {
        // tamper=1 alone must not activate any loop
        let r = record(Some(false), Some(false), Some(false));
        for l in [Loop::One, Loop::Two, Loop::Three] {
            assert!(!l.resolve(&r));
        }
    }

    #[test]
    fn test_defaults_by_kind() {
        assert_eq!(Loop::default_for(SensorKind::Contact), Loop::Two);
        assert_eq!(Loop::default_for(SensorKind::Motion), Loop::One);
    }

    #[test]
    fn test_parse_loop() {
        assert_eq!("2".parse::<Loop>().unwrap(), Loop::Two);
        assert_eq!("Loop3".parse::<Loop>().unwrap(), Loop::Three);
        assert_eq!(" loop1 ".parse::<Loop>().unwrap(), Loop::One);
        assert!(matches!("4".parse::<Loop>(), Err(BridgeError::Validation(_))));
        assert!(matches!("0".parse::<Loop>(), Err(BridgeError::Validation(_))));
        assert!(matches!("reed".parse::<Loop>(), Err(BridgeError::Validation(_))));
    }

    #[test]
    fn test_serde_as_number() {
        assert_eq!(serde_json::to_string(&Loop::Three).unwrap(), "3");
        assert_eq!(serde_json::from_str::<Loop>("1").unwrap(), Loop::One);
        assert!(serde_json::from_str::<Loop>("4").is_err());
    }
}
