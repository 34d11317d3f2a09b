//! BLE gateway tool for edge devices
//!
//! Authenticates edges over the mutual authentication service and relays
//! MQTT/network proxy messages once the session is established.

use btleplug::platform::Adapter;
use clap::{Parser, Subcommand, ValueEnum};
use data_encoding::HEXLOWER;
use gatelink_ble_controller::{EdgeConnection, ble};
use gatelink_crypto::{IdentityKeys, cert};
use gatelink_gateway::{Channel, Credentials, GatewayConfig, SessionEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Certificates minted by `keygen` are good for ten years
const VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[derive(Parser)]
#[command(name = "gatelink-ble")]
#[command(about = "BLE gateway tool for edge devices")]
struct Cli {
    /// Config file (default: $GATELINK_HOME/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for edge devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Authenticate an edge and print what it reports about itself
    Info {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Authenticate an edge and stay connected, printing proxy traffic
    Authenticate {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Authenticate, then send one message on a proxy channel
    Publish {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        #[arg(long, value_enum, default_value = "mqtt")]
        channel: ProxyChannel,
        /// Keep listening for replies this many seconds after sending
        #[arg(short, long, default_value = "0")]
        listen: u64,
        message: String,
    },
    /// Create a root CA and a gateway identity signed by it
    Keygen {
        /// Output directory (default: $GATELINK_HOME)
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Also create an edge identity for bench firmware
        #[arg(long)]
        edge: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProxyChannel {
    Mqtt,
    Network,
}

impl From<ProxyChannel> for Channel {
    fn from(channel: ProxyChannel) -> Self {
        match channel {
            ProxyChannel::Mqtt => Channel::Mqtt,
            ProxyChannel::Network => Channel::Network,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = GatewayConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan { duration } => {
            let adapter = ble::get_adapter().await?;
            scan_devices(&adapter, duration).await?;
        }
        Commands::Info { device } => {
            let adapter = ble::get_adapter().await?;
            let mut edge = authenticate(&adapter, &config, device).await?;
            settle(&mut edge).await?;
            let info = edge.session().device_info();
            println!("{}", serde_json::to_string_pretty(info)?);
            edge.disconnect().await?;
        }
        Commands::Authenticate { device } => {
            let adapter = ble::get_adapter().await?;
            let mut edge = authenticate(&adapter, &config, device).await?;
            println!("Listening for proxy traffic, Ctrl-C to stop");
            loop {
                tokio::select! {
                    events = edge.step() => {
                        if !report(&mut edge, events).await? {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            edge.disconnect().await?;
        }
        Commands::Publish {
            device,
            channel,
            listen,
            message,
        } => {
            let adapter = ble::get_adapter().await?;
            let mut edge = authenticate(&adapter, &config, device).await?;
            settle(&mut edge).await?;

            println!("Sending {} bytes...", message.len());
            let events = edge
                .session_mut()
                .send(channel.into(), message.as_bytes(), std::time::Instant::now())?;
            report(&mut edge, events).await?;
            settle(&mut edge).await?;
            println!("Sent!");

            let until = tokio::time::Instant::now() + Duration::from_secs(listen);
            while let Ok(events) = tokio::time::timeout_at(until, edge.step()).await {
                if !report(&mut edge, events).await? {
                    break;
                }
            }
            edge.disconnect().await?;
        }
        Commands::Keygen { out, edge } => {
            let dir = match out {
                Some(dir) => dir,
                None => gatelink_gateway::gatelink_home()?,
            };
            keygen(&dir, edge)?;
        }
    }

    Ok(())
}

async fn scan_devices(adapter: &Adapter, duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for edge devices ({} seconds)...", duration);

    let devices = ble::scan(adapter, duration).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        let marker = if device.is_edge { " [EDGE]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
    }

    Ok(())
}

/// Find, connect and run the handshake to completion
async fn authenticate(
    adapter: &Adapter,
    config: &GatewayConfig,
    target: Option<String>,
) -> Result<EdgeConnection, Box<dyn std::error::Error>> {
    let credentials = Arc::new(Credentials::load(config)?);
    let target = target.or_else(|| config.device_name_filter.clone());

    println!("Scanning for edge devices...");
    let peripheral = ble::find_device(adapter, target.as_deref(), 5).await?;

    println!("Connecting...");
    let (mut edge, events) = EdgeConnection::open(peripheral, credentials, config).await?;
    report(&mut edge, events).await?;

    while !edge.session().is_established() {
        let events = edge.step().await;
        if !report(&mut edge, events).await? {
            return Err("edge disconnected during the handshake".into());
        }
    }
    Ok(edge)
}

/// Run queued commands until nothing is left in flight
async fn settle(edge: &mut EdgeConnection) -> Result<(), Box<dyn std::error::Error>> {
    while !edge.session().is_idle() {
        let events = edge.step().await;
        if !report(edge, events).await? {
            return Err("edge disconnected".into());
        }
    }
    Ok(())
}

/// Print what happened. `Ok(false)` once the edge is gone for good.
async fn report(
    edge: &mut EdgeConnection,
    events: Vec<SessionEvent>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut alive = true;
    for event in events {
        match event {
            SessionEvent::ConnectionChanged(true) => println!("Connected!"),
            SessionEvent::ConnectionChanged(false) => {
                println!("Disconnected");
                alive = false;
            }
            SessionEvent::StageChanged(stage) => log::info!("handshake stage {stage:?}"),
            SessionEvent::Established { secret_hash } => {
                println!("Authenticated! Session hash {}", HEXLOWER.encode(&secret_hash[..4]));
            }
            SessionEvent::Failed { reason } => {
                return Err(format!("handshake failed (0x{:02x}): {reason}", reason.code()).into());
            }
            SessionEvent::MqttMessage(message) => {
                println!("mqtt <- {}", String::from_utf8_lossy(&message));
            }
            SessionEvent::NetworkMessage(message) => {
                println!("network <- {}", String::from_utf8_lossy(&message));
            }
            SessionEvent::DeviceInfo(field, value) => println!("  {field}: {value}"),
            SessionEvent::MtuChanged(mtu) => log::info!("MTU {mtu}"),
            SessionEvent::ReconnectRequested => {
                println!("Link dropped, reconnecting...");
                let events = edge.reconnect().await?;
                alive = Box::pin(report(edge, events)).await?;
            }
        }
    }
    Ok(alive)
}

fn keygen(dir: &Path, edge: bool) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;

    let root = IdentityKeys::generate();
    let root_ca = cert::issue("Gatelink Root CA", root.public_key(), "Gatelink Root CA", &root, 1, VALIDITY)?;
    std::fs::write(dir.join("root_ca.der"), &root_ca)?;
    std::fs::write(dir.join("root_key.pem"), root.to_pem()?.as_bytes())?;

    let gateway = IdentityKeys::generate();
    let certificate = cert::issue("Gatelink Gateway", gateway.public_key(), "Gatelink Root CA", &root, 2, VALIDITY)?;
    std::fs::write(dir.join("gateway_cert.der"), &certificate)?;
    std::fs::write(dir.join("gateway_key.pem"), gateway.to_pem()?.as_bytes())?;
    println!("Wrote root CA and gateway identity to {}", dir.display());

    if edge {
        let keys = IdentityKeys::generate();
        let certificate = cert::issue("Gatelink Edge", keys.public_key(), "Gatelink Root CA", &root, 3, VALIDITY)?;
        std::fs::write(dir.join("edge_cert.der"), &certificate)?;
        std::fs::write(dir.join("edge_key.pem"), keys.to_pem()?.as_bytes())?;
        println!("Wrote edge identity to {}", dir.display());
    }

    Ok(())
}
