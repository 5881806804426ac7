//! Broker transport built on rumqttc.

use crate::config::MqttConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Message received from MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

/// Message the broker publishes on our behalf if the session dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything needed to open one broker session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub last_will: Option<Will>,
}

impl SessionOptions {
    pub fn from_config(config: &MqttConfig) -> Self {
        Self {
            broker_host: config.broker_host.clone(),
            broker_port: config.broker_port,
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            last_will: None,
        }
    }

    pub fn with_last_will(mut self, will: Will) -> Self {
        self.last_will = Some(will);
        self
    }

    /// Options for a short side session next to a running bridge. It gets
    /// its own client id, so the broker does not take over the bridge's
    /// session, and no last will.
    pub fn one_shot(&self) -> Self {
        Self {
            client_id: format!("{}-cli", self.client_id),
            last_will: None,
            ..self.clone()
        }
    }
}

/// A publish/subscribe session with a broker.
///
/// Calls return once the request is handed to the session. Failures are
/// reported, never retried here; reconnect policy belongs to the caller.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, options: &SessionOptions) -> Result<()>;
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<()>;
    async fn unsubscribe(&mut self, topic: &str) -> Result<()>;
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
    -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// rumqttc-backed transport.
///
/// Each `connect` spawns a task driving a fresh event loop. Inbound PUBLISH
/// packets are forwarded to the channel given at construction. The task ends
/// on the first connection error and does not reconnect.
pub struct RumqttTransport {
    inbound: mpsc::Sender<MqttMessage>,
    client: Option<AsyncClient>,
    event_task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl RumqttTransport {
    pub fn new(inbound: mpsc::Sender<MqttMessage>) -> Self {
        Self {
            inbound,
            client: None,
            event_task: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn client(&self) -> Result<&AsyncClient> {
        self.client
            .as_ref()
            .ok_or_else(|| BridgeError::Connection("no broker session".to_string()))
    }

    fn teardown(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.client = None;
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&mut self, options: &SessionOptions) -> Result<()> {
        self.teardown();

        let mut mqtt = MqttOptions::new(
            options.client_id.clone(),
            options.broker_host.clone(),
            options.broker_port,
        );
        mqtt.set_keep_alive(options.keep_alive);

        // Set credentials if provided
        if let (Some(username), Some(password)) = (&options.username, &options.password) {
            mqtt.set_credentials(username.clone(), password.clone());
        }
        if let Some(will) = &options.last_will {
            mqtt.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone().into_bytes(),
                will.qos,
                will.retain,
            ));
        }

        let (client, event_loop) = AsyncClient::new(mqtt, 100);
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut task = tokio::spawn(drive_event_loop(
            event_loop,
            self.inbound.clone(),
            self.connected.clone(),
            ready_tx,
        ));

        match tokio::time::timeout(options.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                self.client = Some(client);
                self.event_task = Some(task);
                Ok(())
            }
            Ok(Ok(Err(reason))) => {
                // The task has already returned
                let _ = (&mut task).await;
                Err(BridgeError::Connection(reason))
            }
            Ok(Err(_)) => {
                task.abort();
                Err(BridgeError::Connection(
                    "event loop ended before CONNACK".to_string(),
                ))
            }
            Err(_) => {
                task.abort();
                Err(BridgeError::Connection(format!(
                    "no CONNACK from {}:{} within {:?}",
                    options.broker_host, options.broker_port, options.connect_timeout
                )))
            }
        }
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<()> {
        self.client()?.subscribe(topic, qos).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.client()?.unsubscribe(topic).await?;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.client()?.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let client = self.client.take().ok_or_else(|| {
            BridgeError::Connection("disconnect requested without a session".to_string())
        })?;
        client.disconnect().await?;

        // Let the event loop flush the DISCONNECT packet before dropping it
        if let Some(mut task) = self.event_task.take()
            && tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
        {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::SeqCst)
    }
}

/// Connect, publish one message and disconnect.
///
/// Nothing is announced on the status topics; those belong to the bridge
/// session. The publish result wins over a failed disconnect.
pub async fn publish_once<T: Transport>(
    transport: &mut T,
    options: &SessionOptions,
    topic: &str,
    payload: &[u8],
    retain: bool,
) -> Result<()> {
    transport.connect(options).await?;
    let published = transport
        .publish(topic, payload.to_vec(), QoS::AtLeastOnce, retain)
        .await;
    if let Err(e) = transport.disconnect().await {
        warn!("[MQTT] Disconnect after one-shot publish failed: {}", e);
    }
    published
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    inbound: mpsc::Sender<MqttMessage>,
    connected: Arc<AtomicBool>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let mut ready = Some(ready);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected.store(true, Ordering::SeqCst);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                } else {
                    let reason = format!("broker refused connection: {:?}", ack.code);
                    error!("[MQTT] {}", reason);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(reason));
                    }
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = match String::from_utf8(publish.payload.to_vec()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("[MQTT] Invalid UTF-8 in payload on {}: {}", publish.topic, e);
                        continue;
                    }
                };

                debug!("[MQTT] Received on {}: {}", publish.topic, payload);

                let msg = MqttMessage {
                    topic: publish.topic.clone(),
                    payload,
                };
                if inbound.send(msg).await.is_err() {
                    error!("[MQTT] Message channel closed");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("[MQTT] Broker closed the session");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("[MQTT] Session closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("[MQTT] Connection error: {}", e);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.to_string()));
                }
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}
