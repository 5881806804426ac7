//! Routes parsed telemetry to logical devices.

use super::SensorKind;
use super::record::SensorRecord;
use super::registry::{DeviceState, LogicalDevice, ObserveOutcome, Registry};
use super::sink::{AttributeValue, DeviceSink};
use crate::clock::Clock;
use crate::error::Result;
use log::{debug, info, warn};
use std::sync::Arc;

/// What happened to one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// State and attributes were emitted for a bound device.
    Delivered {
        device_id: String,
        state: DeviceState,
    },
    /// Unbound sensor seen for the first time.
    Discovered { sensor_id: u32 },
    /// Unbound sensor seen before; nothing changed.
    AlreadyKnown { sensor_id: u32 },
    /// Decoded by rtl_433 but not a Honeywell sensor.
    ForeignModel { model: String },
}

pub struct EventRouter {
    registry: Arc<Registry>,
    sink: Arc<dyn DeviceSink>,
    clock: Arc<dyn Clock>,
}

impl EventRouter {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn DeviceSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            sink,
            clock,
        }
    }

    /// Route one raw payload.
    ///
    /// A malformed payload is logged and returned as a `Parse` error. The
    /// sensor repeats every transmission, so the caller just drops it.
    pub fn route(&self, raw: &str) -> Result<RouteOutcome> {
        let record = SensorRecord::parse(raw).inspect_err(|e| {
            warn!("[Router] Dropping payload: {}", e);
        })?;

        if !record.is_honeywell() {
            let model = record.model.unwrap_or_default();
            debug!("[Router] Ignoring {} sensor {}", model, record.id);
            return Ok(RouteOutcome::ForeignModel { model });
        }

        if let Some(device) = self.registry.bound_device(record.id) {
            return Ok(self.deliver(&device, &record, raw));
        }

        Ok(match self.registry.observe(&record, raw) {
            ObserveOutcome::Discovered => RouteOutcome::Discovered {
                sensor_id: record.id,
            },
            ObserveOutcome::AlreadyKnown => RouteOutcome::AlreadyKnown {
                sensor_id: record.id,
            },
        })
    }

    fn deliver(&self, device: &LogicalDevice, record: &SensorRecord, raw: &str) -> RouteOutcome {
        let id = device.device_id.as_str();
        let active = device.sensor_loop.resolve(record);

        let state = match device.kind {
            SensorKind::Motion => {
                self.sink.emit_motion_state(id, active);
                if active {
                    DeviceState::Active
                } else {
                    DeviceState::Inactive
                }
            }
            SensorKind::Contact => {
                self.sink.emit_contact_state(id, active);
                if active {
                    DeviceState::Open
                } else {
                    DeviceState::Closed
                }
            }
        };

        let flags = [
            ("contact_open", record.contact_open),
            ("reed_open", record.reed_open),
            ("alarm", record.alarm),
            ("tamper", record.tamper),
            ("battery_ok", record.battery_ok),
            ("heartbeat", record.heartbeat),
        ];
        for (name, value) in flags {
            if let Some(value) = value {
                self.sink.emit_attribute(id, name, value.into());
            }
        }
        if let Some(channel) = record.channel {
            self.sink.emit_attribute(id, "channel", channel.into());
        }
        if let Some(code) = record.event_code {
            self.sink.emit_attribute(id, "lastEventType", code.into());
        }
        if let Some(tamper) = record.tamper {
            let note = if tamper { "Case tampered" } else { "Case secure" };
            self.sink.emit_attribute(id, "caseIntegrity", note.into());
        }

        let now = self.clock.now();
        self.sink
            .emit_attribute(id, "lastEventTime", AttributeValue::Text(now.to_rfc3339()));
        self.sink.emit_attribute(id, "lastPayload", raw.into());

        let previous = device.last_state;
        self.registry.record_event(id, state, now, record.tamper);
        if previous != Some(state) {
            info!("[Router] {} ({}) is {}", device.label, id, state);
        } else {
            debug!("[Router] {} ({}) still {}", device.label, id, state);
        }

        RouteOutcome::Delivered {
            device_id: device.device_id.clone(),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::sensors::loops::Loop;
    use crate::sensors::sink::SinkEvent;
    use crate::store::MemoryStore;
    use crate::testing::{FixedClock, RecordingSink};

    const FRONT_DOOR: &str = r#"{"time":"1700000000","model":"Honeywell-Security","id":980740,"channel":8,"event":128,"state":"open","contact_open":1,"reed_open":0,"alarm":0,"tamper":0,"battery_ok":1,"heartbeat":0,"mic":"CRC"}"#;

    fn setup() -> (Arc<Registry>, Arc<RecordingSink>, EventRouter) {
        let registry = Arc::new(Registry::load(Arc::new(MemoryStore::new())));
        let sink = Arc::new(RecordingSink::default());
        let router = EventRouter::new(
            registry.clone(),
            sink.clone(),
            Arc::new(FixedClock::at(1_700_000_123)),
        );
        (registry, sink, router)
    }

    fn attribute(events: &[SinkEvent], name: &str) -> Option<AttributeValue> {
        events.iter().find_map(|e| match e {
            SinkEvent::Attribute {
                name: n, value, ..
            } if n == name => Some(value.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_bound_contact_on_reed_loop_reports_closed() {
        let (registry, sink, router) = setup();
        registry
            .bind("980740", SensorKind::Contact, "Front Door")
            .unwrap();

        let outcome = router.route(FRONT_DOOR).unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Delivered {
                device_id: "Honeywell_980740".to_string(),
                state: DeviceState::Closed
            }
        );

        let events = sink.events();
        assert_eq!(
            events[0],
            SinkEvent::Contact {
                device_id: "Honeywell_980740".to_string(),
                open: false
            }
        );
        assert_eq!(
            attribute(&events, "contact_open"),
            Some(AttributeValue::Bool(true))
        );
        assert_eq!(
            attribute(&events, "reed_open"),
            Some(AttributeValue::Bool(false))
        );
        assert_eq!(attribute(&events, "lastEventType"), Some(AttributeValue::Int(128)));
        assert_eq!(
            attribute(&events, "caseIntegrity"),
            Some(AttributeValue::Text("Case secure".to_string()))
        );
        assert_eq!(
            attribute(&events, "lastEventTime"),
            Some(AttributeValue::Text("2023-11-14T22:15:23+00:00".to_string()))
        );
        assert_eq!(
            attribute(&events, "lastPayload"),
            Some(AttributeValue::Text(FRONT_DOOR.to_string()))
        );

        let device = registry.device("Honeywell_980740").unwrap();
        assert_eq!(device.last_state, Some(DeviceState::Closed));
        assert_eq!(device.tamper_state, Some(false));
    }

    #[test]
    fn test_loop_change_switches_field() {
        let (registry, _, router) = setup();
        registry
            .bind("980740", SensorKind::Contact, "Front Door")
            .unwrap();
        registry.set_loop("Honeywell_980740", Loop::One).unwrap();

        let outcome = router.route(FRONT_DOOR).unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::Delivered {
                state: DeviceState::Open,
                ..
            }
        ));
    }

    #[test]
    fn test_motion_sensor_states() {
        let (registry, sink, router) = setup();
        registry.bind("4242", SensorKind::Motion, "Hall").unwrap();

        router.route(r#"{"id":4242,"contact_open":1}"#).unwrap();
        router.route(r#"{"id":4242,"contact_open":0}"#).unwrap();

        let states: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Motion { active, .. } => Some(active),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![true, false]);
    }

    #[test]
    fn test_repeated_record_emits_twice() {
        let (registry, sink, router) = setup();
        registry
            .bind("980740", SensorKind::Contact, "Front Door")
            .unwrap();

        router.route(FRONT_DOOR).unwrap();
        let first = sink.take();
        router.route(FRONT_DOOR).unwrap();
        let second = sink.take();

        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_tamper_note() {
        let (registry, sink, router) = setup();
        registry.bind("9", SensorKind::Contact, "Back Door").unwrap();

        router.route(r#"{"id":9,"reed_open":1,"tamper":1}"#).unwrap();
        assert_eq!(
            attribute(&sink.events(), "caseIntegrity"),
            Some(AttributeValue::Text("Case tampered".to_string()))
        );
        assert_eq!(
            registry.device("Honeywell_9").unwrap().tamper_state,
            Some(true)
        );
    }

    #[test]
    fn test_partial_record_only_emits_present_fields() {
        let (registry, sink, router) = setup();
        registry.bind("9", SensorKind::Contact, "Back Door").unwrap();

        router.route(r#"{"id":9,"reed_open":1}"#).unwrap();
        let events = sink.events();
        assert!(attribute(&events, "contact_open").is_none());
        assert!(attribute(&events, "tamper").is_none());
        assert!(attribute(&events, "caseIntegrity").is_none());
        assert_eq!(
            attribute(&events, "reed_open"),
            Some(AttributeValue::Bool(true))
        );
    }

    #[test]
    fn test_unbound_sensor_goes_to_registry() {
        let (registry, sink, router) = setup();

        assert_eq!(
            router.route(FRONT_DOOR).unwrap(),
            RouteOutcome::Discovered { sensor_id: 980740 }
        );
        let snapshot = registry.known_snapshot(980740).unwrap();
        assert_eq!(
            router.route(FRONT_DOOR).unwrap(),
            RouteOutcome::AlreadyKnown { sensor_id: 980740 }
        );
        assert_eq!(registry.known_snapshot(980740).unwrap(), snapshot);
        assert_eq!(registry.known_sensors().len(), 1);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let (registry, sink, router) = setup();
        assert!(matches!(
            router.route("{\"id\":"),
            Err(BridgeError::Parse(_))
        ));
        assert!(registry.known_sensors().is_empty());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_foreign_model_ignored() {
        let (registry, _, router) = setup();
        let outcome = router
            .route(r#"{"model":"Acurite-Tower","id":1234,"temperature_C":20.1}"#)
            .unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::ForeignModel {
                model: "Acurite-Tower".to_string()
            }
        );
        assert!(registry.known_sensors().is_empty());
    }
}
