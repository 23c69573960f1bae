use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use log::{error, info};

mod ble;
mod config;
mod connection;
mod messages;
mod mqtt;
mod orchestrator;
mod simulator;
mod uwb;

use config::{AppConfig, Backend};
use orchestrator::{Orchestrator, RangingSink};
use uwb::{SessionContext, UwbManager};

/// Scan for UWB beacons, connect to the first one found and log ranging updates.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Use the simulated backend regardless of the configured one.
    #[arg(long)]
    simulate: bool,
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = toml::de::from_str(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

async fn run_session<M: UwbManager>(
    manager: M,
    config: &AppConfig,
    sink: Option<Arc<dyn RangingSink>>,
) -> anyhow::Result<()> {
    let max_attempts = config.connect.clone().unwrap_or_default().max_attempts();
    let mut orchestrator = Orchestrator::new(Arc::new(manager), max_attempts);
    if let Some(sink) = sink {
        orchestrator = orchestrator.with_sink(sink);
    }

    let session = SessionContext::new("main");
    let teardown = session.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Error waiting for Ctrl-C: {:?}", err);
        }
        info!("Shutting down");
        teardown.cancel();
    });

    orchestrator.run(session).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;

    let backend = if args.simulate {
        Backend::Simulated
    } else {
        config.backend
    };

    let mqtt_client = config.mqtt.as_ref().map(|mqtt_config| {
        let (client, eventloop) = mqtt::MqttClient::new(mqtt_config);
        tokio::spawn(mqtt::MqttClient::event_loop(eventloop));
        client
    });
    let sink = mqtt_client
        .clone()
        .map(|client| Arc::new(client) as Arc<dyn RangingSink>);

    let scan = config.scan.clone().unwrap_or_default();
    let result = match backend {
        Backend::Ble => run_session(ble::BleManager::new(&scan), &config, sink).await,
        Backend::Simulated => {
            let simulation = config.simulation.clone().unwrap_or_default();
            let manager = simulator::SimulatedManager::new(&scan, &simulation);
            run_session(manager, &config, sink).await
        }
    };

    if let Some(client) = mqtt_client {
        if let Err(err) = client.disconnect().await {
            error!("Error disconnecting MQTT client: {:?}", err);
        }
    }

    result
}
