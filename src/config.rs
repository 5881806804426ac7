use crate::error::{BridgeError, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Load environment variables from a `.env` file in the working directory.
///
/// Values may contain spaces without quoting. Variables already present in
/// the environment win.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    let Ok(content) = fs::read_to_string(env_path) else {
        return;
    };

    for (key, value) in content.lines().filter_map(parse_dotenv_line) {
        if std::env::var(key).is_err() {
            // SAFETY: called from main before the runtime spawns any threads
            unsafe { std::env::set_var(key, value) };
        }
    }
}

fn parse_dotenv_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let mut value = value.trim();
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        value = &value[1..value.len() - 1];
    }
    Some((key, value))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub bridge: BridgeConfig,
    pub log_level: LevelFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Topic rtl_433 publishes decoded events on (wildcards allowed).
    pub events_topic: String,
    /// Root for status, device state and command topics.
    pub base_topic: String,
    /// Address reported in the status announcement.
    pub host_address: String,
    pub store_path: PathBuf,
    /// Seconds between session health checks; 0 disables them.
    pub health_check_secs: u64,
}

const DEFAULT_CLIENT_ID: &str = "honeywell-mqtt-bridge";

fn default_base_topic(client_id: &str) -> String {
    format!("honeywell/{}", client_id)
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("honeywell-mqtt-bridge")
        .join("state.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig {
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                client_id: DEFAULT_CLIENT_ID.to_string(),
                username: None,
                password: None,
                keep_alive_secs: 30,
                connect_timeout_secs: 10,
            },
            bridge: BridgeConfig {
                events_topic: "rtl_433/+/events".to_string(),
                base_topic: default_base_topic(DEFAULT_CLIENT_ID),
                host_address: gethostname::gethostname().to_string_lossy().into_owned(),
                store_path: default_store_path(),
                health_check_secs: 60,
            },
            log_level: LevelFilter::Info,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from `lookup`, falling back to defaults.
    ///
    /// Values that are present but unparsable are rejected rather than
    /// replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        // MQTT configuration
        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Some(port) = parse_var(&lookup, "MQTT_BROKER_PORT")? {
            config.mqtt.broker_port = port;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        if let Some(secs) = parse_var(&lookup, "MQTT_KEEP_ALIVE_SECS")? {
            config.mqtt.keep_alive_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "MQTT_CONNECT_TIMEOUT_SECS")? {
            config.mqtt.connect_timeout_secs = secs;
        }

        // Bridge configuration
        if let Some(topic) = lookup("BRIDGE_EVENTS_TOPIC") {
            config.bridge.events_topic = topic;
        }
        config.bridge.base_topic = lookup("BRIDGE_BASE_TOPIC")
            .unwrap_or_else(|| default_base_topic(&config.mqtt.client_id));
        if let Some(address) = lookup("BRIDGE_HOST_ADDRESS") {
            config.bridge.host_address = address;
        }
        if let Some(path) = lookup("BRIDGE_STORE_PATH") {
            config.bridge.store_path = PathBuf::from(path);
        }
        if let Some(secs) = parse_var(&lookup, "BRIDGE_HEALTH_CHECK_SECS")? {
            config.bridge.health_check_secs = secs;
        }

        if let Some(level) = parse_var(&lookup, "LOG_LEVEL")? {
            config.log_level = level;
        }

        if config.mqtt.client_id.trim().is_empty() {
            return Err(BridgeError::Validation(
                "MQTT_CLIENT_ID must not be empty".to_string(),
            ));
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BridgeError::Validation(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.bridge.events_topic, "rtl_433/+/events");
        assert_eq!(config.bridge.base_topic, "honeywell/honeywell-mqtt-bridge");
        assert_eq!(config.log_level, LevelFilter::Info);
        assert!(config.bridge.store_path.ends_with("state.json"));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("MQTT_BROKER_HOST", "10.0.0.2"),
            ("MQTT_BROKER_PORT", "8883"),
            ("MQTT_CLIENT_ID", "garage-hub"),
            ("MQTT_USERNAME", "rtl"),
            ("MQTT_PASSWORD", "secret"),
            ("BRIDGE_STORE_PATH", "/var/lib/hw/state.json"),
            ("BRIDGE_HEALTH_CHECK_SECS", "0"),
            ("LOG_LEVEL", "TRACE"),
        ])
        .unwrap();
        assert_eq!(config.mqtt.broker_host, "10.0.0.2");
        assert_eq!(config.mqtt.broker_port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("rtl"));
        // Base topic follows the client id unless set explicitly
        assert_eq!(config.bridge.base_topic, "honeywell/garage-hub");
        assert_eq!(
            config.bridge.store_path,
            PathBuf::from("/var/lib/hw/state.json")
        );
        assert_eq!(config.bridge.health_check_secs, 0);
        assert_eq!(config.log_level, LevelFilter::Trace);
    }

    #[test]
    fn test_rejects_unrecognised_values() {
        assert!(matches!(
            config_from(&[("LOG_LEVEL", "verbose")]),
            Err(BridgeError::Validation(_))
        ));
        assert!(matches!(
            config_from(&[("MQTT_BROKER_PORT", "70000")]),
            Err(BridgeError::Validation(_))
        ));
        assert!(matches!(
            config_from(&[("MQTT_CLIENT_ID", " ")]),
            Err(BridgeError::Validation(_))
        ));
    }

    #[test]
    fn test_parse_dotenv_line() {
        assert_eq!(parse_dotenv_line("A=b c"), Some(("A", "b c")));
        assert_eq!(parse_dotenv_line(" KEY = \"quoted\" "), Some(("KEY", "quoted")));
        assert_eq!(parse_dotenv_line("# comment"), None);
        assert_eq!(parse_dotenv_line(""), None);
        assert_eq!(parse_dotenv_line("novalue"), None);
        assert_eq!(parse_dotenv_line("Q='"), Some(("Q", "'")));
    }
}
