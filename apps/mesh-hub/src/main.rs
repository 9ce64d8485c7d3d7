use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mesh_hub::channel::MeshChannel;
use mesh_hub::config::HubConfig;

/// Smart-home / factory LAN mesh hub: discovery, enrollment, device
/// registry, automation, OTA delivery, and hub federation over one
/// authenticated TCP transport.
#[derive(Parser, Debug)]
#[command(name = "mesh-hub", version, about)]
struct Cli {
    /// Path to the hub's TOML configuration file. Missing file falls
    /// back to built-in defaults plus any `MESH_HUB_*` environment
    /// overrides.
    #[arg(short, long, env = "MESH_HUB_CONFIG", default_value = "mesh_hub.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let cli = Cli::parse();
    let config = HubConfig::load(&cli.config).expect("failed to load hub configuration");

    tracing::info!(node_id = %config.node_id, tcp_port = config.tcp_port, udp_port = config.udp_port, "mesh-hub: booting");

    let channel = MeshChannel::new(config).expect("failed to initialize mesh channel");
    channel.start().await.expect("failed to start mesh channel");

    tokio::signal::ctrl_c().await.expect("failed to listen for shutdown signal");
    tracing::info!("mesh-hub: shutdown signal received");
    channel.stop();
}
