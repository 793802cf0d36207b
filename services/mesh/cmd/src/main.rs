//! Mesh node binary.
//!
//! Runs a set of simulated nodes on an in-process self-organizing mesh: each
//! node joins, the bridge is enabled everywhere, a sample packet is bridged
//! from every node to its neighbour's subnet, and the resulting status and
//! bridge counters are printed as JSON before the mesh is torn down.

use anyhow::Context;
use clap::Parser;
use mesh_bridge::{LogOnlyDelivery, SubnetBridge};
use mesh_control::{MeshController, MeshEvent, MeshEventHandler, MeshStatus};
use mesh_routing::{HwAddr, SubnetId};
use mesh_transport::sim::SimMesh;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::MeshLogFormatter;

/// OUI used for simulated node addresses
const SIM_OUI: [u8; 3] = [0x24, 0x6f, 0x28];

/// First simulated node's last address byte, and so its subnet id
const FIRST_NODE: u8 = 37;

/// Simulated geogram mesh with subnet bridging
#[derive(Parser, Debug)]
#[command(name = "geogram-mesh", version, about = "Simulated geogram mesh with IP subnet bridging")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of simulated nodes
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=64))]
    nodes: u8,

    /// How long to keep the mesh up after the sample traffic, e.g. 2s
    #[arg(long, default_value = "2s")]
    run_for: humantime::Duration,

    /// How long to wait for every node to join, e.g. 5s
    #[arg(long, default_value = "5s")]
    settle_timeout: humantime::Duration,
}

/// Logs application mesh events for one node
#[derive(Debug)]
struct EventLogger {
    node: HwAddr,
}

impl MeshEventHandler for EventLogger {
    fn on_mesh_event(&self, event: &MeshEvent) {
        match serde_json::to_string(event) {
            Ok(json) => component_info!("events", "{} {}", self.node, json),
            Err(e) => component_warn!("events", "{} unprintable event: {}", self.node, e),
        }
    }
}

struct SimNode {
    addr: HwAddr,
    controller: MeshController,
    bridge: SubnetBridge,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in [
        "geogram_mesh",
        "mesh_control",
        "mesh_bridge",
        "mesh_transport",
        "mesh_routing",
        "mesh_wire",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(MeshLogFormatter::new("mesh".to_string()))
        .init();

    info!("Starting geogram mesh v{}", env!("CARGO_PKG_VERSION"));

    let node_config = NodeConfig::load_from_file(&args.config)?;
    let mesh_config = node_config.mesh_config();
    mesh_config
        .validate()
        .context("invalid mesh configuration")?;

    let mesh = SimMesh::self_organizing();
    let mut nodes = Vec::with_capacity(args.nodes as usize);

    for index in 0..args.nodes {
        let addr = HwAddr([
            SIM_OUI[0],
            SIM_OUI[1],
            SIM_OUI[2],
            0x00,
            0x00,
            FIRST_NODE + index,
        ]);
        let controller = MeshController::new(Arc::new(mesh.node(addr)));
        controller.init().await?;
        controller
            .start(
                mesh_config
                    .clone()
                    .with_event_handler(Arc::new(EventLogger { node: addr })),
            )
            .await
            .with_context(|| format!("failed to start node {}", addr))?;

        let bridge = SubnetBridge::new(
            controller.clone(),
            node_config.bridge_config(),
            Arc::new(LogOnlyDelivery),
        );
        nodes.push(SimNode {
            addr,
            controller,
            bridge,
        });
    }

    let settled = wait_for_topology(&nodes, *args.settle_timeout).await;
    if !settled {
        warn!("Mesh did not settle within {}", args.settle_timeout);
    }

    for node in &nodes {
        if let Err(e) = node.bridge.enable().await {
            component_warn!("bridge", "{}: bridge not enabled: {}", node.addr, e);
        }
    }

    if node_config.external_ap.enabled {
        start_external_aps(&nodes, &node_config).await;
    }

    send_sample_traffic(&nodes);

    tokio::select! {
        _ = tokio::time::sleep(*args.run_for) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down early");
        }
    }

    let report: Vec<serde_json::Value> = nodes
        .iter()
        .map(|node| {
            serde_json::json!({
                "reported_at": chrono::Local::now().to_rfc3339(),
                "mesh": node.controller.snapshot(),
                "bridge": node.bridge.stats(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);

    // Children first, so the root leaves last and no re-election is triggered
    let mut failed = false;
    for node in nodes.iter().rev() {
        if let Err(e) = node.controller.stop().await {
            error!("Failed to stop node {}: {}", node.addr, e);
            failed = true;
        }
        if let Err(e) = node.controller.deinit().await {
            warn!("Failed to deinit node {}: {}", node.addr, e);
        }
    }

    if failed {
        anyhow::bail!("one or more nodes did not stop cleanly");
    }

    info!("Mesh shutdown complete");
    Ok(())
}

/// Wait until one node is root and every other node is connected
async fn wait_for_topology(nodes: &[SimNode], timeout: Duration) -> bool {
    let settled = || {
        let roots = nodes
            .iter()
            .filter(|node| node.controller.status() == MeshStatus::Root)
            .count();
        roots == 1 && nodes.iter().all(|node| node.controller.is_connected())
    };

    let wait = async {
        while !settled() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    tokio::time::timeout(timeout, wait).await.is_ok()
}

/// Bring up the configured access point on every node
async fn start_external_aps(nodes: &[SimNode], config: &NodeConfig) {
    let ap = &config.external_ap;
    for node in nodes {
        match node
            .controller
            .start_external_ap(&ap.ssid, &ap.password, ap.max_connections)
            .await
        {
            Ok(()) => {
                if let Ok(ip) = node.controller.external_ap_ip() {
                    component_info!("ap", "{}: serving {} at {}", node.addr, ap.ssid, ip);
                }
            }
            Err(e) => component_warn!("ap", "{}: external AP not started: {}", node.addr, e),
        }
    }
}

/// Bridge one packet from every node to the next node's subnet
fn send_sample_traffic(nodes: &[SimNode]) {
    if nodes.len() < 2 {
        info!("Single node mesh, no sample traffic to bridge");
        return;
    }

    for (index, node) in nodes.iter().enumerate() {
        let neighbour = &nodes[(index + 1) % nodes.len()];
        let (Some(src), Some(dest)) = (node.controller.subnet_id(), neighbour.controller.subnet_id())
        else {
            continue;
        };

        let dest_ip = host_in(dest, 20);
        let packet = sample_packet(host_in(src, 20), dest_ip);

        if node.bridge.intercept(dest_ip, &packet) {
            component_info!(
                "bridge",
                "{}: bridged {} bytes to {}",
                node.addr,
                packet.len(),
                dest_ip
            );
        } else {
            component_warn!("bridge", "{}: packet to {} was not bridged", node.addr, dest_ip);
        }
    }
}

fn host_in(subnet: SubnetId, host: u8) -> Ipv4Addr {
    Ipv4Addr::new(192, 168, subnet.octet(), host)
}

/// Minimal IPv4/UDP-shaped packet with a text payload
fn sample_packet(src: Ipv4Addr, dest: Ipv4Addr) -> Vec<u8> {
    let payload = format!("hello from {}", src);
    let total_len = (20 + 8 + payload.len()) as u16;

    let mut packet = Vec::with_capacity(total_len as usize);
    packet.extend_from_slice(&[0x45, 0x00]);
    packet.extend_from_slice(&total_len.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dest.octets());
    packet.extend_from_slice(&5000u16.to_be_bytes());
    packet.extend_from_slice(&5000u16.to_be_bytes());
    packet.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]);
    packet.extend_from_slice(payload.as_bytes());
    packet
}
