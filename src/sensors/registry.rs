//! Known and registered sensor ledgers.
//!
//! * **Known sensors**: every serial ever seen in telemetry, with the first
//!   payload it sent. Bound serials stay in this ledger but are never
//!   reported as unbound.
//! * **Registered sensors**: serial → logical device id. At most one device
//!   per serial; binding an already registered serial is a no-op.
//! * **Devices**: the logical devices themselves, with their loop selection
//!   and last observed state.
//!
//! All three live behind one mutex, so administrative commands and live
//! routing never interleave. Every mutation is written back to the [`Store`]
//! as JSON blobs. Administrative changes only take effect once written; a
//! failed write leaves them undone and returns the store error.

use super::SensorKind;
use super::loops::Loop;
use super::record::{MAX_SENSOR_ID, SensorRecord};
use crate::error::{BridgeError, Result};
use crate::store::Store;
use chrono::{DateTime, Utc};
use log::{error, info, trace, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub const KNOWN_SENSORS_KEY: &str = "knownSensors";
pub const REGISTERED_SENSORS_KEY: &str = "registeredSensors";
pub const DEVICES_KEY: &str = "devices";

/// Logical device ids are derived from the serial with this prefix.
pub const DEVICE_ID_PREFIX: &str = "Honeywell_";

pub fn device_id_for(sensor_id: u32) -> String {
    format!("{}{}", DEVICE_ID_PREFIX, sensor_id)
}

/// Registered-sensor ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredSensor {
    pub logical_device_id: String,
}

/// Last primary state reported for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Active,
    Inactive,
    Open,
    Closed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceState::Active => "active",
            DeviceState::Inactive => "inactive",
            DeviceState::Open => "open",
            DeviceState::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalDevice {
    pub device_id: String,
    pub sensor_id: u32,
    pub label: String,
    pub kind: SensorKind,
    #[serde(rename = "loop")]
    pub sensor_loop: Loop,
    #[serde(default)]
    pub last_state: Option<DeviceState>,
    #[serde(default)]
    pub last_event_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tamper_state: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// First sighting; a known-sensor entry was created.
    Discovered,
    /// Already known; the first-seen snapshot was kept.
    AlreadyKnown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// The serial is now registered. `device_created` is false when a device
    /// object survived a reset; it keeps its kind, label and loop.
    Bound {
        device_id: String,
        device_created: bool,
    },
    /// The serial was already registered. The binding ledger is untouched;
    /// `device_created` reports whether a missing device object was restored.
    AlreadyBound {
        device_id: String,
        device_created: bool,
    },
}

impl BindOutcome {
    pub fn device_id(&self) -> &str {
        match self {
            BindOutcome::Bound { device_id, .. } | BindOutcome::AlreadyBound { device_id, .. } => {
                device_id
            }
        }
    }
}

/// One persisted ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blob {
    Known,
    Registered,
    Devices,
}

impl Blob {
    fn key(self) -> &'static str {
        match self {
            Blob::Known => KNOWN_SENSORS_KEY,
            Blob::Registered => REGISTERED_SENSORS_KEY,
            Blob::Devices => DEVICES_KEY,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Ledgers {
    known: BTreeMap<u32, serde_json::Value>,
    registered: BTreeMap<u32, RegisteredSensor>,
    devices: BTreeMap<String, LogicalDevice>,
}

impl Ledgers {
    fn encode(&self, blob: Blob) -> Result<String> {
        Ok(match blob {
            Blob::Known => serde_json::to_string(&self.known)?,
            Blob::Registered => serde_json::to_string(&self.registered)?,
            Blob::Devices => serde_json::to_string(&self.devices)?,
        })
    }
}

pub struct Registry {
    store: Arc<dyn Store>,
    ledgers: Mutex<Ledgers>,
}

impl Registry {
    /// Load all ledgers from `store`. Missing or unreadable blobs start empty.
    pub fn load(store: Arc<dyn Store>) -> Self {
        let ledgers = Ledgers {
            known: load_blob(store.as_ref(), KNOWN_SENSORS_KEY),
            registered: load_blob(store.as_ref(), REGISTERED_SENSORS_KEY),
            devices: load_blob(store.as_ref(), DEVICES_KEY),
        };
        info!(
            "[Registry] Loaded {} known, {} registered sensor(s), {} device(s)",
            ledgers.known.len(),
            ledgers.registered.len(),
            ledgers.devices.len()
        );
        Self {
            store,
            ledgers: Mutex::new(ledgers),
        }
    }

    /// Record a sighting of an unbound sensor. First-seen wins.
    pub fn observe(&self, record: &SensorRecord, raw: &str) -> ObserveOutcome {
        let mut ledgers = self.ledgers.lock();
        if ledgers.known.contains_key(&record.id) {
            trace!("[Registry] Sensor {} already known", record.id);
            return ObserveOutcome::AlreadyKnown;
        }

        let snapshot = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        ledgers.known.insert(record.id, snapshot);
        info!("[Registry] Discovered new sensor {}", record.id);
        // Logged only; the next discovery rewrites the whole ledger
        self.save_or_log(&ledgers, Blob::Known);
        ObserveOutcome::Discovered
    }

    /// Bind a sensor serial to a logical device, creating the device.
    ///
    /// `sensor_id` is taken as text because it comes straight from the
    /// command surface. Nothing is mutated when validation fails.
    pub fn bind(&self, sensor_id: &str, kind: SensorKind, label: &str) -> Result<BindOutcome> {
        let label = label.trim();
        if label.is_empty() {
            return Err(BridgeError::Validation(
                "device label must not be empty".to_string(),
            ));
        }
        let sensor_id = parse_sensor_id(sensor_id)?;
        let device_id = device_id_for(sensor_id);

        let mut ledgers = self.ledgers.lock();
        let mut next = ledgers.clone();
        let mut dirty = Vec::new();

        let device_created = match next.devices.get(&device_id) {
            Some(existing) => {
                if existing.kind != kind || existing.label != label {
                    warn!(
                        "[Registry] Keeping existing {} device {} ('{}'), requested {} '{}' ignored",
                        existing.kind, device_id, existing.label, kind, label
                    );
                }
                false
            }
            None => {
                next.devices.insert(
                    device_id.clone(),
                    LogicalDevice {
                        device_id: device_id.clone(),
                        sensor_id,
                        label: label.to_string(),
                        kind,
                        sensor_loop: Loop::default_for(kind),
                        last_state: None,
                        last_event_timestamp: None,
                        tamper_state: None,
                    },
                );
                dirty.push(Blob::Devices);
                true
            }
        };

        let bound_to = next
            .registered
            .get(&sensor_id)
            .map(|entry| entry.logical_device_id.clone());
        if bound_to.is_none() {
            next.registered.insert(
                sensor_id,
                RegisteredSensor {
                    logical_device_id: device_id.clone(),
                },
            );
            dirty.push(Blob::Registered);
        }

        self.commit(&mut ledgers, next, &dirty)?;
        if device_created {
            info!(
                "[Registry] Created {} device {} ('{}')",
                kind, device_id, label
            );
        }

        match bound_to {
            Some(existing) => {
                warn!(
                    "[Registry] Sensor {} is already bound to {}, binding left unchanged",
                    sensor_id, existing
                );
                Ok(BindOutcome::AlreadyBound {
                    device_id,
                    device_created,
                })
            }
            None => {
                info!("[Registry] Bound sensor {} to {}", sensor_id, device_id);
                Ok(BindOutcome::Bound {
                    device_id,
                    device_created,
                })
            }
        }
    }

    /// Delete a logical device and every registration pointing at it.
    pub fn unbind(&self, device_id: &str) -> Result<LogicalDevice> {
        let mut ledgers = self.ledgers.lock();
        let mut next = ledgers.clone();
        let device = next
            .devices
            .remove(device_id)
            .ok_or_else(|| BridgeError::NotFound(format!("device {}", device_id)))?;

        // Match on the stored device id, not on the key
        let before = next.registered.len();
        next.registered
            .retain(|_, entry| entry.logical_device_id != device_id);
        let removed = before - next.registered.len();

        self.commit(&mut ledgers, next, &[Blob::Devices, Blob::Registered])?;
        info!(
            "[Registry] Removed device {} and {} registration(s)",
            device_id, removed
        );
        Ok(device)
    }

    pub fn set_loop(&self, device_id: &str, sensor_loop: Loop) -> Result<()> {
        let mut ledgers = self.ledgers.lock();
        let mut next = ledgers.clone();
        next.devices
            .get_mut(device_id)
            .ok_or_else(|| BridgeError::NotFound(format!("device {}", device_id)))?
            .sensor_loop = sensor_loop;

        self.commit(&mut ledgers, next, &[Blob::Devices])?;
        info!("[Registry] {} now follows {}", device_id, sensor_loop);
        Ok(())
    }

    /// Clear the known and registered ledgers. Device objects are kept.
    pub fn reset_state(&self) -> Result<()> {
        let mut ledgers = self.ledgers.lock();
        let next = Ledgers {
            devices: ledgers.devices.clone(),
            ..Ledgers::default()
        };

        self.commit(&mut ledgers, next, &[Blob::Known, Blob::Registered])?;
        warn!(
            "[Registry] Sensor ledgers cleared, {} device(s) kept",
            ledgers.devices.len()
        );
        Ok(())
    }

    /// The device bound to `sensor_id`, if any.
    pub fn bound_device(&self, sensor_id: u32) -> Option<LogicalDevice> {
        let ledgers = self.ledgers.lock();
        ledgers
            .registered
            .get(&sensor_id)
            .and_then(|entry| ledgers.devices.get(&entry.logical_device_id))
            .cloned()
    }

    /// Store the outcome of a routed event on the device.
    pub fn record_event(
        &self,
        device_id: &str,
        state: DeviceState,
        at: DateTime<Utc>,
        tamper: Option<bool>,
    ) {
        let mut ledgers = self.ledgers.lock();
        let Some(device) = ledgers.devices.get_mut(device_id) else {
            return;
        };
        let changed = device.last_state != Some(state)
            || (tamper.is_some() && device.tamper_state != tamper);
        device.last_state = Some(state);
        device.last_event_timestamp = Some(at);
        if tamper.is_some() {
            device.tamper_state = tamper;
        }
        // Repeated transmissions only refresh the timestamp in memory
        if changed {
            self.save_or_log(&ledgers, Blob::Devices);
        }
    }

    /// Sensors seen in telemetry and not bound to any device.
    pub fn known_sensors(&self) -> BTreeMap<u32, serde_json::Value> {
        let ledgers = self.ledgers.lock();
        ledgers
            .known
            .iter()
            .filter(|(id, _)| !ledgers.registered.contains_key(id))
            .map(|(id, raw)| (*id, raw.clone()))
            .collect()
    }

    /// First payload recorded for `sensor_id`, bound or not.
    pub fn known_snapshot(&self, sensor_id: u32) -> Option<serde_json::Value> {
        self.ledgers.lock().known.get(&sensor_id).cloned()
    }

    pub fn registered_sensors(&self) -> BTreeMap<u32, RegisteredSensor> {
        self.ledgers.lock().registered.clone()
    }

    pub fn device(&self, device_id: &str) -> Option<LogicalDevice> {
        self.ledgers.lock().devices.get(device_id).cloned()
    }

    pub fn devices(&self) -> Vec<LogicalDevice> {
        self.ledgers.lock().devices.values().cloned().collect()
    }

    /// Write `blobs` from `next`, then make it current.
    ///
    /// On failure `current` stays as it was and the blobs already written
    /// are put back.
    fn commit(&self, current: &mut Ledgers, next: Ledgers, blobs: &[Blob]) -> Result<()> {
        for (done, blob) in blobs.iter().enumerate() {
            if let Err(e) = self.save(&next, *blob) {
                error!("[Registry] Failed to save {}: {}", blob.key(), e);
                for written in &blobs[..done] {
                    if let Err(e) = self.save(current, *written) {
                        error!("[Registry] Failed to restore {}: {}", written.key(), e);
                    }
                }
                return Err(e);
            }
        }
        *current = next;
        Ok(())
    }

    fn save(&self, ledgers: &Ledgers, blob: Blob) -> Result<()> {
        self.store.set(blob.key(), ledgers.encode(blob)?)
    }

    fn save_or_log(&self, ledgers: &Ledgers, blob: Blob) {
        if let Err(e) = self.save(ledgers, blob) {
            error!("[Registry] Failed to save {}: {}", blob.key(), e);
        }
    }
}

fn load_blob<T: DeserializeOwned + Default>(store: &dyn Store, key: &str) -> T {
    match store.get(key) {
        Some(blob) => serde_json::from_str(&blob).unwrap_or_else(|e| {
            warn!("[Registry] Discarding unreadable {} blob: {}", key, e);
            T::default()
        }),
        None => T::default(),
    }
}

fn parse_sensor_id(raw: &str) -> Result<u32> {
    let id: u32 = raw
        .trim()
        .parse()
        .map_err(|_| BridgeError::Validation(format!("sensor id '{}' is not a number", raw)))?;
    if id == 0 || id > MAX_SENSOR_ID {
        return Err(BridgeError::Validation(format!(
            "sensor id {} outside 1..={}",
            id, MAX_SENSOR_ID
        )));
    }
    Ok(id)
}
