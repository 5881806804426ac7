//! Device-state sink: where routed sensor state goes.
//!
//! The router only knows the [`DeviceSink`] trait. The daemon plugs in a
//! [`ChannelSink`] and republishes each [`SinkEvent`] to MQTT; tests plug in a
//! recorder. The sink receives every emission, including repeats of an
//! unchanged value, so suppressing the radio's repeated transmissions is the
//! consumer's job.

use log::debug;
use std::fmt;
use tokio::sync::mpsc;

/// Value of an auxiliary device attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Int(i)
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

/// Receives state for logical devices.
pub trait DeviceSink: Send + Sync {
    fn emit_attribute(&self, device_id: &str, name: &str, value: AttributeValue);
    fn emit_motion_state(&self, device_id: &str, active: bool);
    fn emit_contact_state(&self, device_id: &str, open: bool);
}

/// One emission, as carried by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Attribute {
        device_id: String,
        name: String,
        value: AttributeValue,
    },
    Motion {
        device_id: String,
        active: bool,
    },
    Contact {
        device_id: String,
        open: bool,
    },
}

impl SinkEvent {
    pub fn device_id(&self) -> &str {
        match self {
            SinkEvent::Attribute { device_id, .. }
            | SinkEvent::Motion { device_id, .. }
            | SinkEvent::Contact { device_id, .. } => device_id,
        }
    }

    /// Attribute name and rendered value. Primary transitions use `state`.
    pub fn name_and_value(&self) -> (&str, String) {
        match self {
            SinkEvent::Attribute { name, value, .. } => (name, value.to_string()),
            SinkEvent::Motion { active, .. } => (
                "state",
                if *active { "active" } else { "inactive" }.to_string(),
            ),
            SinkEvent::Contact { open, .. } => {
                ("state", if *open { "open" } else { "closed" }.to_string())
            }
        }
    }
}

/// Sink that forwards every emission over an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            debug!("Sink receiver dropped, discarding device event");
        }
    }
}

impl DeviceSink for ChannelSink {
    fn emit_attribute(&self, device_id: &str, name: &str, value: AttributeValue) {
        self.send(SinkEvent::Attribute {
            device_id: device_id.to_string(),
            name: name.to_string(),
            value,
        });
    }

    fn emit_motion_state(&self, device_id: &str, active: bool) {
        self.send(SinkEvent::Motion {
            device_id: device_id.to_string(),
            active,
        });
    }

    fn emit_contact_state(&self, device_id: &str, open: bool) {
        self.send(SinkEvent::Contact {
            device_id: device_id.to_string(),
            open,
        });
    }
}
