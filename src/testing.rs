//! Test doubles for the transport, sink and clock seams.

use crate::clock::Clock;
use crate::error::{BridgeError, Result};
use crate::input::mqtt::{SessionOptions, Transport};
use crate::sensors::sink::{AttributeValue, DeviceSink, SinkEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Clock that only moves when told to.
pub struct FixedClock {
    secs: AtomicI64,
}

impl FixedClock {
    pub fn at(secs: i64) -> Self {
        Self {
            secs: AtomicI64::new(secs),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.secs.load(Ordering::SeqCst), 0).unwrap()
    }
}

/// Sink that keeps every emission.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<SinkEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl DeviceSink for RecordingSink {
    fn emit_attribute(&self, device_id: &str, name: &str, value: AttributeValue) {
        self.events.lock().push(SinkEvent::Attribute {
            device_id: device_id.to_string(),
            name: name.to_string(),
            value,
        });
    }

    fn emit_motion_state(&self, device_id: &str, active: bool) {
        self.events.lock().push(SinkEvent::Motion {
            device_id: device_id.to_string(),
            active,
        });
    }

    fn emit_contact_state(&self, device_id: &str, open: bool) {
        self.events.lock().push(SinkEvent::Contact {
            device_id: device_id.to_string(),
            open,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    connect_attempts: usize,
    failing_connects: usize,
    drop_on_publish: bool,
    /// `Some(session_gone)` makes the next disconnect fail.
    disconnect_failure: Option<bool>,
    last_options: Option<SessionOptions>,
    published: Vec<Published>,
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
}

/// In-memory transport. Clones share state, so a test keeps one handle
/// while the connection manager owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().failing_connects = n;
    }

    pub fn drop_session(&self) {
        self.state.lock().connected = false;
    }

    pub fn drop_on_next_publish(&self) {
        self.state.lock().drop_on_publish = true;
    }

    pub fn fail_disconnect(&self, session_gone: bool) {
        self.state.lock().disconnect_failure = Some(session_gone);
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn last_options(&self) -> Option<SessionOptions> {
        self.state.lock().last_options.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    pub fn clear_published(&self) {
        self.state.lock().published.clear();
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.state.lock().subscribed.clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.state.lock().unsubscribed.clone()
    }
}

fn no_session() -> BridgeError {
    BridgeError::Connection("no broker session".to_string())
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, options: &SessionOptions) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        state.last_options = Some(options.clone());
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            state.connected = false;
            return Err(BridgeError::Connection("connection refused".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(no_session());
        }
        state.subscribed.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(no_session());
        }
        state.unsubscribed.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.drop_on_publish {
            state.drop_on_publish = false;
            state.connected = false;
        }
        if !state.connected {
            return Err(no_session());
        }
        state.published.push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            qos,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(session_gone) = state.disconnect_failure.take() {
            if session_gone {
                state.connected = false;
            }
            return Err(BridgeError::Connection("disconnect failed".to_string()));
        }
        if !state.connected {
            return Err(no_session());
        }
        state.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}
