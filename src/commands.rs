//! Administrative and session commands.
//!
//! Commands arrive as JSON on the bridge's command topic while the daemon
//! runs, e.g. `{"command":"bind","sensor_id":"980740","kind":"contact",
//! "label":"Front Door"}`, or from the CLI. Registry commands can be applied
//! without a broker session; session commands need the running bridge.

use crate::error::{BridgeError, Result};
use crate::sensors::{BindOutcome, Loop, Registry, SensorKind};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Connect,
    Disconnect,
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        payload: String,
        #[serde(default)]
        retain: bool,
    },
    Bind {
        #[serde(deserialize_with = "text_or_number")]
        sensor_id: String,
        kind: SensorKind,
        label: String,
    },
    Unbind {
        device_id: String,
    },
    SetLoop {
        device_id: String,
        #[serde(rename = "loop")]
        sensor_loop: Loop,
    },
    ResetState,
    List,
}

impl Command {
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| BridgeError::Validation(format!("bad command: {}", e)))
    }

    /// Apply a registry command and describe the result.
    pub fn apply(&self, registry: &Registry) -> Result<String> {
        match self {
            Command::Bind {
                sensor_id,
                kind,
                label,
            } => {
                let outcome = registry.bind(sensor_id, *kind, label)?;
                Ok(match outcome {
                    BindOutcome::Bound {
                        device_id,
                        device_created: true,
                    } => format!("sensor {} bound to {}", sensor_id, device_id),
                    BindOutcome::Bound { device_id, .. } => format!(
                        "sensor {} bound to existing device {}; its kind, label and loop were kept",
                        sensor_id, device_id
                    ),
                    BindOutcome::AlreadyBound {
                        device_id,
                        device_created: true,
                    } => format!(
                        "sensor {} already bound; recreated missing device {}",
                        sensor_id, device_id
                    ),
                    BindOutcome::AlreadyBound { device_id, .. } => {
                        format!("sensor {} already bound to {}", sensor_id, device_id)
                    }
                })
            }
            Command::Unbind { device_id } => {
                let device = registry.unbind(device_id)?;
                Ok(format!(
                    "removed {} (sensor {})",
                    device.device_id, device.sensor_id
                ))
            }
            Command::SetLoop {
                device_id,
                sensor_loop,
            } => {
                registry.set_loop(device_id, *sensor_loop)?;
                Ok(format!("{} now follows {}", device_id, sensor_loop))
            }
            Command::ResetState => {
                registry.reset_state()?;
                Ok("known and registered sensor ledgers cleared".to_string())
            }
            Command::List => {
                let listing = serde_json::json!({
                    "knownSensors": registry.known_sensors(),
                    "registeredSensors": registry.registered_sensors(),
                    "devices": registry.devices(),
                });
                Ok(serde_json::to_string_pretty(&listing)?)
            }
            other => Err(BridgeError::Validation(format!(
                "{:?} needs a running bridge",
                other
            ))),
        }
    }
}

fn text_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
