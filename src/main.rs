//! Econet Bridge - AUN, WebSocket and Piconet transports for Acorn Econet
//!
//! Runs the bridge loop with whichever transports the configuration enables.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use econet_bridge::addressing::{AunMap, AunRule, PiconetMap, WsMap};
use econet_bridge::config::{self, Config};
use econet_bridge::network::{open_piconet, AddressMaps, Bridge, Dispatcher, WsServer};
use econet_bridge::protocol;
use econet_bridge::security::{SecurityManager, UserFileBackend};
use econet_bridge::service::ServiceRegistry;

/// Events buffered between connection tasks and the bridge loop
const EVENT_QUEUE: usize = 256;

/// Econet Bridge - Econet over AUN, WebSocket and Piconet
#[derive(Parser)]
#[command(name = "econet-bridge")]
#[command(author = "Econet Bridge Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Bridge Acorn Econet traffic between AUN, WebSocket and Piconet", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge
    Run {
        /// AUN UDP port (overrides configuration)
        #[arg(long)]
        aun_port: Option<u16>,

        /// WebSocket port (overrides configuration)
        #[arg(long)]
        ws_port: Option<u16>,

        /// Piconet serial device; enables the Piconet transport
        #[arg(long)]
        serial: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show bridge information
    Info,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            aun_port,
            ws_port,
            serial,
        } => {
            if let Some(port) = aun_port {
                config.aun.port = port;
            }
            if let Some(port) = ws_port {
                config.websocket.port = port;
            }
            if let Some(device) = serial {
                config.piconet.device = device;
                config.piconet.enabled = true;
            }
            run_bridge(config).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_bridge_info(&config);
        }
    }

    Ok(())
}

/// Build the three address maps from files and inline settings
fn load_address_maps(config: &Config) -> anyhow::Result<AddressMaps> {
    let mut aun = match &config.aun.map_file {
        Some(path) => AunMap::load(path)
            .with_context(|| format!("Failed to load AUN map {}", path.display()))?,
        None => AunMap::new(),
    };
    for line in &config.aun.rules {
        let rule = AunRule::parse(line)
            .map_err(|e| anyhow::anyhow!("Invalid AUN rule {:?}: {}", line, e))?;
        aun.add_rule(rule);
    }

    let mut piconet = PiconetMap::new(config.piconet.networks.iter().copied());
    if let Some(path) = &config.piconet.networks_file {
        let listed = PiconetMap::load(path)
            .with_context(|| format!("Failed to load Piconet networks {}", path.display()))?;
        for network in listed.networks() {
            piconet.add_network(network);
        }
    }
    if config.piconet.enabled {
        // The Piconet sits on the local wire
        piconet.add_network(config.bridge.network);
    }

    let mut dynamic = config.websocket.dynamic_networks.clone();
    if let Some(path) = &config.websocket.dynamic_networks_file {
        let listed = WsMap::load(path)
            .with_context(|| format!("Failed to load dynamic networks {}", path.display()))?;
        dynamic.extend(listed.networks());
    }
    let websocket = WsMap::new(dynamic);

    Ok(AddressMaps {
        aun,
        piconet,
        websocket,
    })
}

fn build_security(config: &Config) -> anyhow::Result<SecurityManager> {
    let settings = &config.security;
    let backend = match &settings.users_file {
        Some(path) => UserFileBackend::open(path, settings.home_root.clone())
            .with_context(|| format!("Failed to load users {}", path.display()))?,
        None => UserFileBackend::in_memory(settings.home_root.clone()),
    };

    let mut security = SecurityManager::new(settings.max_idle(), settings.library_path.clone());
    security.add_backend(Box::new(backend));
    Ok(security)
}

async fn bind_aun(config: &Config) -> anyhow::Result<Arc<UdpSocket>> {
    let bind_addr = format!("{}:{}", config.aun.bind_address, config.aun.port);
    let socket = UdpSocket::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind AUN socket on {}", bind_addr))?;
    // Subnet broadcasts go out through the same socket
    socket.set_broadcast(true)?;
    Ok(Arc::new(socket))
}

/// Run the bridge until Ctrl+C
async fn run_bridge(config: Config) -> anyhow::Result<()> {
    let ctx = config.frame_context();
    let maps = load_address_maps(&config)?;

    tracing::info!(
        "Starting '{}' as Econet station {}",
        config.general.name,
        ctx.bridge
    );
    tracing::info!(
        "{} AUN rules, {} Piconet networks, {} dynamic networks",
        maps.aun.rule_count(),
        maps.piconet.networks().count(),
        maps.websocket.networks().count()
    );

    let security = build_security(&config)?;
    let mut dispatcher = Dispatcher::new(maps, config.aun.port);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

    let udp = if config.aun.enabled {
        let socket = bind_aun(&config).await?;
        tracing::info!("AUN listening on {}", socket.local_addr()?);
        dispatcher.set_udp(socket.clone());
        Some(socket)
    } else {
        None
    };

    let mut ws_server = if config.websocket.enabled {
        let mut server = WsServer::new(
            &config.websocket.bind_address,
            config.websocket.port,
            event_tx.clone(),
        );
        server.start().await?;
        Some(server)
    } else {
        None
    };

    if config.piconet.enabled {
        let serial = open_piconet(
            &config.piconet.device,
            config.piconet.baud_rate,
            config.bridge.network,
            event_tx.clone(),
        )
        .with_context(|| format!("Failed to open Piconet on {}", config.piconet.device))?;
        serial.initialise(config.bridge.station)?;
        dispatcher.set_serial(Some(serial));
    }

    println!("\n========================================");
    println!("  Econet Bridge Running");
    println!("========================================");
    println!("  Station: {}", ctx.bridge);
    if config.aun.enabled {
        println!("  AUN: UDP port {}", config.aun.port);
    }
    if config.websocket.enabled {
        println!("  WebSocket: port {}", config.websocket.port);
    }
    if config.piconet.enabled {
        println!("  Piconet: {}", config.piconet.device);
    }
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    let bridge = Bridge::new(ctx, dispatcher, security, ServiceRegistry::new());
    bridge
        .run(udp, event_rx, config.security.housekeeping_interval())
        .await;

    // Held until here so the loop never sees its event channel close
    drop(event_tx);

    if let Some(server) = ws_server.as_mut() {
        server.stop().await?;
    }
    tracing::info!("Bridge stopped");

    Ok(())
}

/// Print bridge information
fn print_bridge_info(config: &Config) {
    println!("Econet Bridge Information");
    println!("=========================\n");

    println!("Instance: {}", config.instance_id());
    println!("Station: {}", config.bridge_address());
    println!(
        "Firmware version: {}.{}",
        config.bridge.version_major, config.bridge.version_minor
    );

    println!("\nDefault AUN Port: {}", protocol::DEFAULT_AUN_PORT);
    println!("Default WebSocket Port: {}", protocol::DEFAULT_WS_PORT);
    println!("Default Piconet Baud: {}", protocol::DEFAULT_PICONET_BAUD);
}

#[cfg(test)]
mod tests {
    use super::*;
    use econet_bridge::protocol::EconetAddr;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["econet-bridge", "info"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from([
            "econet-bridge",
            "-v",
            "run",
            "--aun-port",
            "32769",
            "--serial",
            "/dev/ttyUSB0",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                aun_port, serial, ws_port,
            } => {
                assert_eq!(aun_port, Some(32769));
                assert_eq!(serial.as_deref(), Some("/dev/ttyUSB0"));
                assert_eq!(ws_port, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_load_address_maps_from_settings() {
        let mut config = Config::default();
        config.bridge.network = 127;
        config.aun.rules = vec!["192.168.0.0/24 127".to_string()];
        config.websocket.dynamic_networks = vec![200];
        config.piconet.enabled = true;
        config.piconet.networks = vec![3];

        let maps = load_address_maps(&config).unwrap();
        assert_eq!(
            maps.aun.resolve_socket(&"192.168.0.9:32768".parse().unwrap()),
            Some(EconetAddr::new(127, 9))
        );
        assert!(maps.piconet.network_known(3));
        assert!(maps.piconet.network_known(127));
        assert_eq!(maps.websocket.networks().collect::<Vec<_>>(), vec![200]);
    }

    #[test]
    fn test_invalid_rule_is_reported() {
        let mut config = Config::default();
        config.aun.rules = vec!["not-an-ip 1".to_string()];
        assert!(load_address_maps(&config).is_err());
    }

    #[test]
    fn test_bind_aun_on_ephemeral_port() {
        let mut config = Config::default();
        config.aun.bind_address = "127.0.0.1".to_string();
        config.aun.port = 0;

        tokio_test::block_on(async {
            let socket = bind_aun(&config).await.unwrap();
            assert!(socket.broadcast().unwrap());
            assert_ne!(socket.local_addr().unwrap().port(), 0);
        });
    }
}
