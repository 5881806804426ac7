//! Input sources for the bridge.
//!
//! Current input sources:
//! - `mqtt`: rtl_433 decoded radio events relayed through an MQTT broker

pub mod mqtt;
