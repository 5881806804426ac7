//! MQTT integration orchestrator.
//!
//! Ties the broker session, the event router and the command surface
//! together. One inbound message is handled to completion (route or command,
//! then republish of the resulting device state) before the next is read.
//!
//! Topics under the base topic:
//! - `<base>/command`: JSON [`Command`]s, results on `<base>/command/result`
//! - `<base>/devices/<deviceId>/<attribute>`: retained device state
//! - `<base>/status/...`: liveness, see [`ConnectionManager`]

use super::client::{MqttMessage, Transport};
use super::connection::ConnectionManager;
use crate::clock::Clock;
use crate::commands::Command;
use crate::error::Result;
use crate::sensors::{ChannelSink, EventRouter, Registry, RouteOutcome, SinkEvent};
use log::{debug, error, info, warn};
use rumqttc::QoS;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

pub struct SensorBridge<T: Transport> {
    connection: ConnectionManager<T>,
    registry: Arc<Registry>,
    router: EventRouter,
    device_events: mpsc::UnboundedReceiver<SinkEvent>,
    events_topic: String,
    base_topic: String,
}

impl<T: Transport> SensorBridge<T> {
    pub fn new(
        connection: ConnectionManager<T>,
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        events_topic: impl Into<String>,
        base_topic: impl Into<String>,
    ) -> Self {
        let (sink, device_events) = ChannelSink::new();
        let router = EventRouter::new(registry.clone(), Arc::new(sink), clock);
        Self {
            connection,
            registry,
            router,
            device_events,
            events_topic: events_topic.into(),
            base_topic: base_topic.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn command_topic(&self) -> String {
        format!("{}/command", self.base_topic)
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    /// Connect and subscribe to the events and command topics.
    pub async fn start(&mut self) -> Result<()> {
        self.connection.connect().await?;
        let events_topic = self.events_topic.clone();
        let command_topic = self.command_topic();
        self.connection.subscribe(&events_topic).await?;
        self.connection.subscribe(&command_topic).await?;
        info!(
            "[MQTT] Bridge listening on {} ({} device(s) bound)",
            events_topic,
            self.registry.registered_sensors().len()
        );
        Ok(())
    }

    /// Run until `shutdown` resolves or the inbound channel closes, then
    /// disconnect. A failed initial connect is returned, not retried.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<MqttMessage>,
        health_check: Option<Duration>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        self.start().await?;

        let mut health = health_check.map(|every| {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("[MQTT] Shutdown requested");
                    break;
                }
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        warn!("[MQTT] Inbound message channel closed");
                        break;
                    }
                },
                _ = next_tick(&mut health) => match self.connection.health_check().await {
                    Ok(true) => info!("[MQTT] Session restored by health check"),
                    Ok(false) => {}
                    Err(e) => error!("[MQTT] Health check reconnect failed: {}", e),
                },
            }
        }

        self.connection.disconnect().await
    }

    /// Execute one command against the session or the registry.
    pub async fn execute(&mut self, command: Command) -> Result<String> {
        let result = match &command {
            Command::Connect => self
                .connection
                .connect()
                .await
                .map(|()| "connected".to_string()),
            Command::Disconnect => self
                .connection
                .disconnect()
                .await
                .map(|()| "disconnected".to_string()),
            Command::Subscribe { topic } => self
                .connection
                .subscribe(topic)
                .await
                .map(|()| format!("subscribed to {}", topic)),
            Command::Unsubscribe { topic } => self
                .connection
                .unsubscribe(topic)
                .await
                .map(|()| format!("unsubscribed from {}", topic)),
            Command::Publish {
                topic,
                payload,
                retain,
            } => self
                .connection
                .publish(topic, payload.as_bytes(), QoS::AtMostOnce, *retain)
                .await
                .map(|()| format!("published to {}", topic)),
            registry_command => registry_command.apply(&self.registry),
        };

        match &result {
            Ok(message) => info!("[Command] {}", message),
            Err(e) => error!("[Command] {:?} failed: {}", command, e),
        }
        result
    }

    pub async fn handle_message(&mut self, msg: MqttMessage) {
        if msg.topic == self.command_topic() {
            let result = match Command::parse(&msg.payload) {
                Ok(command) => self.execute(command).await,
                Err(e) => {
                    warn!("[Command] {}", e);
                    Err(e)
                }
            };
            self.publish_command_result(result).await;
        } else {
            // Parse failures are already logged and the sensor will repeat
            if let Ok(outcome) = self.router.route(&msg.payload) {
                match outcome {
                    RouteOutcome::Discovered { sensor_id } => {
                        info!("[MQTT] New unbound sensor {} on {}", sensor_id, msg.topic);
                    }
                    other => debug!("[MQTT] {} -> {:?}", msg.topic, other),
                }
            }
        }
        self.flush_device_events().await;
    }

    async fn publish_command_result(&mut self, result: Result<String>) {
        // Never reconnect just to report on a disconnect command
        if !self.connection.is_connected() {
            return;
        }
        let body = match result {
            Ok(message) => serde_json::json!({ "ok": true, "message": message }),
            Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
        };
        let topic = format!("{}/result", self.command_topic());
        if let Err(e) = self
            .connection
            .publish(&topic, body.to_string().as_bytes(), QoS::AtMostOnce, false)
            .await
        {
            warn!("[Command] Failed to publish result: {}", e);
        }
    }

    async fn flush_device_events(&mut self) {
        while let Ok(event) = self.device_events.try_recv() {
            if !self.connection.wants_session() {
                debug!("[MQTT] Session closed on request, not republishing {:?}", event);
                continue;
            }
            let (name, value) = event.name_and_value();
            let topic = format!("{}/devices/{}/{}", self.base_topic, event.device_id(), name);
            if let Err(e) = self
                .connection
                .publish(&topic, value.as_bytes(), QoS::AtMostOnce, true)
                .await
            {
                warn!("[MQTT] Dropping device updates, publish failed: {}", e);
                while self.device_events.try_recv().is_ok() {}
                break;
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
