//! MQTT input source for rtl_433 telemetry.
//!
//! `client` owns the wire: a rumqttc session behind the [`Transport`] trait.
//! `connection` layers the session lifecycle on top (last will, status
//! announcement, reconnect-on-demand). `integration` runs the bridge loop.

mod client;
mod connection;
mod integration;

pub use client::{MqttMessage, RumqttTransport, SessionOptions, Transport, Will, publish_once};
pub use connection::{ConnectionManager, ConnectionState, HostInfo};
pub use integration::SensorBridge;
