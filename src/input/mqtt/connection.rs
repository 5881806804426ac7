//! Broker session lifecycle.
//!
//! State machine: `Disconnected → Connecting → Connected → Disconnected`.
//! A failed connect goes straight back to `Disconnected` and is never retried
//! automatically. Subscribe, unsubscribe and publish heal a dropped session
//! with exactly one connect attempt before giving up.
//!
//! Every successful connect announces liveness under `<base>/status/`:
//! `online`, `version`, `address` and `uptime` (seconds since the host
//! booted), all retained. The last will overwrites `online` with `false` if
//! the session dies.

use super::client::{SessionOptions, Transport, Will};
use crate::clock::Clock;
use crate::error::Result;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use rumqttc::QoS;
use std::collections::BTreeSet;
use std::sync::Arc;

const PROC_UPTIME: &str = "/proc/uptime";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Host details published in the status announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub version: String,
    pub address: String,
    /// When the host booted. Without it, uptime counts from bridge start.
    pub booted_at: Option<DateTime<Utc>>,
}

impl HostInfo {
    pub fn new(address: impl Into<String>) -> Self {
        let booted_at = match std::fs::read_to_string(PROC_UPTIME) {
            Ok(text) => parse_proc_uptime(&text)
                .and_then(TimeDelta::try_seconds)
                .and_then(|uptime| Utc::now().checked_sub_signed(uptime)),
            Err(e) => {
                debug!("[MQTT] No host uptime from {}: {}", PROC_UPTIME, e);
                None
            }
        };
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            address: address.into(),
            booted_at,
        }
    }
}

/// Whole seconds from the first field of `/proc/uptime` ("12345.67 54321.00").
fn parse_proc_uptime(text: &str) -> Option<i64> {
    let secs: f64 = text.split_whitespace().next()?.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then_some(secs as i64)
}

enum Request<'a> {
    Subscribe(&'a str),
    Unsubscribe(&'a str),
    Publish {
        topic: &'a str,
        payload: &'a [u8],
        qos: QoS,
        retain: bool,
    },
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    options: SessionOptions,
    status_base: String,
    host: HostInfo,
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
    state: ConnectionState,
    /// False after an explicit disconnect; health checks leave it alone then.
    wanted: bool,
    subscriptions: BTreeSet<String>,
}

impl<T: Transport> ConnectionManager<T> {
    /// `base_topic` is the root for status topics; the last will is derived
    /// from it and overrides any will already in `options`.
    pub fn new(
        transport: T,
        options: SessionOptions,
        base_topic: &str,
        host: HostInfo,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let status_base = format!("{}/status", base_topic.trim_end_matches('/'));
        let options = options.with_last_will(Will {
            topic: format!("{}/online", status_base),
            payload: "false".to_string(),
            qos: QoS::AtLeastOnce,
            retain: true,
        });
        let started_at = clock.now();
        Self {
            transport,
            options,
            status_base,
            host,
            clock,
            started_at,
            state: ConnectionState::Disconnected,
            wanted: false,
            subscriptions: BTreeSet::new(),
        }
    }

    /// A session the transport lost reads as `Disconnected`.
    pub fn state(&self) -> ConnectionState {
        if self.state == ConnectionState::Connected && !self.transport.is_connected() {
            ConnectionState::Disconnected
        } else {
            self.state
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport.is_connected()
    }

    /// False once the session was closed on request.
    pub fn wants_session(&self) -> bool {
        self.wanted
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    /// Open the session, announce liveness and restore subscriptions.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            debug!("[MQTT] Already connected");
            return Ok(());
        }
        if self.state == ConnectionState::Connected {
            warn!("[MQTT] Session lost, reconnecting");
            self.state = ConnectionState::Disconnected;
        }

        self.state = ConnectionState::Connecting;
        self.wanted = true;
        info!(
            "[MQTT] Connecting to {}:{} as {}",
            self.options.broker_host, self.options.broker_port, self.options.client_id
        );

        if let Err(e) = self.transport.connect(&self.options).await {
            self.state = ConnectionState::Disconnected;
            error!("[MQTT] Connection failed: {}", e);
            return Err(e);
        }
        self.state = ConnectionState::Connected;
        info!("[MQTT] Connected");

        if let Err(e) = self.announce().await {
            warn!("[MQTT] Failed to publish status announcement: {}", e);
        }

        let topics: Vec<String> = self.subscriptions.iter().cloned().collect();
        for topic in topics {
            if let Err(e) = self.transport.subscribe(&topic, QoS::AtMostOnce).await {
                warn!("[MQTT] Failed to restore subscription {}: {}", topic, e);
            }
        }
        Ok(())
    }

    /// Close the session.
    ///
    /// If the transport reports a failure, the real session state decides
    /// the outcome: an already closed session counts as disconnected.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Disconnected && !self.transport.is_connected() {
            self.wanted = false;
            debug!("[MQTT] Already disconnected");
            return Ok(());
        }

        // A clean DISCONNECT suppresses the will, so say it ourselves
        let online = self.status_topic("online");
        if self.transport.is_connected()
            && let Err(e) = self
                .transport
                .publish(&online, b"false".to_vec(), QoS::AtLeastOnce, true)
                .await
        {
            warn!("[MQTT] Failed to publish offline status: {}", e);
        }

        match self.transport.disconnect().await {
            Ok(()) => {
                self.state = ConnectionState::Disconnected;
                self.wanted = false;
                info!("[MQTT] Disconnected");
                Ok(())
            }
            Err(e) if !self.transport.is_connected() => {
                self.state = ConnectionState::Disconnected;
                self.wanted = false;
                warn!("[MQTT] Disconnect reported '{}' but the session is closed", e);
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Connected;
                error!("[MQTT] Disconnect failed: {}", e);
                Err(e)
            }
        }
    }

    pub async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.perform(Request::Subscribe(topic)).await?;
        self.subscriptions.insert(topic.to_string());
        info!("[MQTT] Subscribed to {}", topic);
        Ok(())
    }

    pub async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.perform(Request::Unsubscribe(topic)).await?;
        self.subscriptions.remove(topic);
        info!("[MQTT] Unsubscribed from {}", topic);
        Ok(())
    }

    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.perform(Request::Publish {
            topic,
            payload,
            qos,
            retain,
        })
        .await?;
        debug!("[MQTT] Published {} byte(s) to {}", payload.len(), topic);
        Ok(())
    }

    /// Reconnect if the session dropped while a connection is wanted.
    /// Returns whether a reconnect happened.
    pub async fn health_check(&mut self) -> Result<bool> {
        if !self.wanted || self.is_connected() {
            return Ok(false);
        }
        self.connect().await?;
        Ok(true)
    }

    pub fn status_topic(&self, leaf: &str) -> String {
        format!("{}/{}", self.status_base, leaf)
    }

    async fn perform(&mut self, request: Request<'_>) -> Result<()> {
        let healed = if self.is_connected() {
            false
        } else {
            self.connect().await?;
            true
        };

        match self.dispatch(&request).await {
            Ok(()) => Ok(()),
            // The session died under us; one reconnect attempt per call
            Err(e) if !healed && !self.transport.is_connected() => {
                warn!("[MQTT] Request failed on a dropped session: {}", e);
                self.connect().await?;
                self.dispatch(&request).await
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(&mut self, request: &Request<'_>) -> Result<()> {
        match *request {
            Request::Subscribe(topic) => self.transport.subscribe(topic, QoS::AtMostOnce).await,
            Request::Unsubscribe(topic) => self.transport.unsubscribe(topic).await,
            Request::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                self.transport
                    .publish(topic, payload.to_vec(), qos, retain)
                    .await
            }
        }
    }

    async fn announce(&mut self) -> Result<()> {
        let since = self.host.booted_at.unwrap_or(self.started_at);
        let uptime = (self.clock.now() - since).num_seconds().max(0);
        let values = [
            ("online", "true".to_string()),
            ("version", self.host.version.clone()),
            ("address", self.host.address.clone()),
            ("uptime", uptime.to_string()),
        ];
        for (leaf, value) in values {
            let topic = self.status_topic(leaf);
            self.transport
                .publish(&topic, value.into_bytes(), QoS::AtLeastOnce, true)
                .await?;
        }
        debug!("[MQTT] Announced status under {}", self.status_base);
        Ok(())
    }
}
