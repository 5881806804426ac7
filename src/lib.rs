//! Honeywell security sensor bridge library.
//!
//! Routes Honeywell 345 MHz contact and motion sensor events, decoded by
//! rtl_433 and relayed over MQTT, to logical devices. Sensors nobody has
//! claimed yet are tracked until an operator binds them.

pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod input;
pub mod instance_lock;
pub mod sensors;
pub mod store;

#[cfg(test)]
mod testing;
