//! Mesh network node binary.
//!
//! Runs one Bluetooth mesh node: network layer, lower transport and a UDP
//! emulation of the advertising bearer, driven by tokio.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod bearer;
mod config;
mod logging;
mod node;
mod scheduler;

use config::MeshConfig;
use logging::MeshLogFormatter;
use node::Node;

/// Bluetooth mesh node over a UDP advertising bearer
#[derive(Parser, Debug)]
#[command(name = "mesh-node", version, about = "Bluetooth mesh network node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Unicast address of the primary element, e.g. 0x0001
    #[arg(long, value_parser = config::parse_u16)]
    unicast_addr: Option<u16>,

    /// Listen address, e.g. 127.0.0.1:7001
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer bearer address, e.g. 127.0.0.1:7002 (repeatable)
    #[arg(long)]
    peer: Vec<SocketAddr>,

    /// Secure Network beacon interval, e.g. 10s
    #[arg(long)]
    beacon_interval: Option<humantime::Duration>,

    /// Publish the configured payload to this address periodically
    #[arg(long, value_parser = config::parse_u16)]
    publish: Option<u16>,

    /// Publication period, e.g. 5s
    #[arg(long)]
    publish_period: Option<humantime::Duration>,

    /// Publish heartbeats to this address
    #[arg(long, value_parser = config::parse_u16)]
    heartbeat: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command line values win over the config file and environment
    fn apply(&self, config: &mut MeshConfig) {
        if let Some(addr) = self.unicast_addr {
            config.unicast_addr = addr;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if !self.peer.is_empty() {
            config.peers = self.peer.clone();
        }
        if let Some(interval) = self.beacon_interval {
            config.beacon_interval = interval.into();
        }
        if let Some(dst) = self.publish {
            config.publish_dst = dst;
        }
        if let Some(period) = self.publish_period {
            config.publish_period = period.into();
        }
        if let Some(dst) = self.heartbeat {
            config.heartbeat_dst = dst;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for krate in [
        "mesh_node",
        "mesh_net",
        "mesh_transport",
        "mesh_subnet",
        "mesh_storage",
        "mesh_wire",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", krate, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(MeshLogFormatter::new("mesh".to_string()))
        .init();

    info!("Starting mesh node v{}", env!("CARGO_PKG_VERSION"));

    let mut mesh_config = MeshConfig::load_from_file(&args.config)?;
    args.apply(&mut mesh_config);

    let node = Node::start(mesh_config).await?;
    info!("Bearer listening on {}", node.local_addr()?);
    node.run(shutdown_signal()).await?;

    info!("Mesh node stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to wait for SIGINT: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM signal"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT signal"),
            Err(e) => warn!("Failed to wait for SIGINT: {}", e),
        },
    }
}
