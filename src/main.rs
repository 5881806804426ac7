use clap::{Parser, Subcommand};
use honeywell_mqtt_bridge::clock::{Clock, SystemClock};
use honeywell_mqtt_bridge::commands::Command;
use honeywell_mqtt_bridge::config::{self, Config};
use honeywell_mqtt_bridge::error::{BridgeError, Result};
use honeywell_mqtt_bridge::input::mqtt::{
    self, ConnectionManager, HostInfo, RumqttTransport, SensorBridge, SessionOptions,
};
use honeywell_mqtt_bridge::instance_lock::InstanceLock;
use honeywell_mqtt_bridge::sensors::{Loop, Registry, SensorKind};
use honeywell_mqtt_bridge::store::FileStore;
use log::{LevelFilter, error, info};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(
    name = "honeywell-mqtt-bridge",
    version,
    about = "Routes rtl_433 Honeywell security sensor events to logical devices"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Connect to the broker and route sensor events until Ctrl+C (default)
    Run,
    /// Bind a sensor serial to a new contact or motion device
    Bind {
        sensor_id: String,
        kind: SensorKind,
        label: String,
    },
    /// Delete a device and its sensor binding
    Unbind { device_id: String },
    /// Choose which loop (1 contact, 2 reed, 3 alarm) drives a device
    SetLoop {
        device_id: String,
        #[arg(value_name = "LOOP")]
        sensor_loop: Loop,
    },
    /// Print known sensors, bindings and devices
    List,
    /// Clear the known and registered sensor ledgers
    Reset,
    /// Publish one message through a short side session
    Publish {
        topic: String,
        payload: String,
        #[arg(long)]
        retain: bool,
    },
}

fn init_logger(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

fn main() -> ExitCode {
    // Load .env file before anything else
    config::load_dotenv();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logger(config.log_level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command.unwrap_or(CliCommand::Run) {
            CliCommand::Run => run_bridge(config).await,
            CliCommand::Publish {
                topic,
                payload,
                retain,
            } => publish_once(config, &topic, payload.as_bytes(), retain).await,
            CliCommand::Bind {
                sensor_id,
                kind,
                label,
            } => run_admin(
                &config,
                Command::Bind {
                    sensor_id,
                    kind,
                    label,
                },
            ),
            CliCommand::Unbind { device_id } => run_admin(&config, Command::Unbind { device_id }),
            CliCommand::SetLoop {
                device_id,
                sensor_loop,
            } => run_admin(
                &config,
                Command::SetLoop {
                    device_id,
                    sensor_loop,
                },
            ),
            CliCommand::List => run_admin(&config, Command::List),
            CliCommand::Reset => run_admin(&config, Command::ResetState),
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn lock_state(config: &Config) -> Result<InstanceLock> {
    InstanceLock::acquire(&config.bridge.store_path).map_err(|e| {
        BridgeError::Store(format!(
            "{}; while the bridge runs, send commands to {}/command",
            e, config.bridge.base_topic
        ))
    })
}

async fn run_bridge(config: Config) -> Result<()> {
    info!("Starting Honeywell MQTT bridge");
    info!(
        "  Broker: {}:{} (client id {})",
        config.mqtt.broker_host, config.mqtt.broker_port, config.mqtt.client_id
    );
    info!("  Events topic: {}", config.bridge.events_topic);
    info!("  Base topic: {}", config.bridge.base_topic);
    info!("  State file: {:?}", config.bridge.store_path);

    let _lock = lock_state(&config)?;
    let store = Arc::new(FileStore::open(&config.bridge.store_path));
    let registry = Arc::new(Registry::load(store));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (msg_tx, msg_rx) = mpsc::channel(64);
    let connection = ConnectionManager::new(
        RumqttTransport::new(msg_tx),
        SessionOptions::from_config(&config.mqtt),
        &config.bridge.base_topic,
        HostInfo::new(config.bridge.host_address.clone()),
        clock.clone(),
    );
    let bridge = SensorBridge::new(
        connection,
        registry,
        clock,
        config.bridge.events_topic.clone(),
        config.bridge.base_topic.clone(),
    );

    let health_check =
        (config.bridge.health_check_secs > 0).then(|| Duration::from_secs(config.bridge.health_check_secs));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    bridge.run(msg_rx, health_check, shutdown).await?;
    info!("Honeywell MQTT bridge stopped");
    Ok(())
}

fn run_admin(config: &Config, command: Command) -> Result<()> {
    let _lock = lock_state(config)?;
    let store = Arc::new(FileStore::open(&config.bridge.store_path));
    let registry = Registry::load(store);
    let message = command.apply(&registry)?;
    println!("{}", message);
    Ok(())
}

async fn publish_once(config: Config, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
    // Inbound messages are not consumed here
    let (msg_tx, _msg_rx) = mpsc::channel(1);
    let mut transport = RumqttTransport::new(msg_tx);
    let options = SessionOptions::from_config(&config.mqtt).one_shot();
    mqtt::publish_once(&mut transport, &options, topic, payload, retain).await?;
    info!("Published {} byte(s) to {}", payload.len(), topic);
    Ok(())
}
