//! Configuration handling for the mesh node.
//!
//! Settings come from a YAML file, then `GEOGRAM_MESH_*` environment
//! variables override individual keys. A missing or unparsable file is not
//! fatal: defaults are used and a warning is logged.

use anyhow::Result;
use mesh_bridge::{BridgeConfig, DEFAULT_MAX_PACKET_SIZE, DEFAULT_QUEUE_CAPACITY};
use mesh_control::MeshConfig;
use mesh_routing::{HwAddr, DEFAULT_ROUTE_TABLE_CAPACITY};
use mesh_transport::{DEFAULT_CHANNEL, DEFAULT_MAX_LAYER, DEFAULT_MESH_ID};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "GEOGRAM_MESH_";

/// Node configuration as read from YAML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Mesh membership settings
    pub mesh: MeshSection,
    /// Subnet bridge settings
    pub bridge: BridgeSection,
    /// Access point for non-mesh stations
    pub external_ap: ExternalApSection,
}

/// `mesh:` section
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSection {
    pub mesh_id: HwAddr,
    pub channel: u8,
    pub max_layer: u8,
    pub allow_root: bool,
    pub password: String,
    pub route_table_capacity: usize,
}

impl Default for MeshSection {
    fn default() -> Self {
        Self {
            mesh_id: HwAddr(DEFAULT_MESH_ID),
            channel: DEFAULT_CHANNEL,
            max_layer: DEFAULT_MAX_LAYER,
            allow_root: true,
            password: String::new(),
            route_table_capacity: DEFAULT_ROUTE_TABLE_CAPACITY,
        }
    }
}

impl std::fmt::Debug for MeshSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshSection")
            .field("mesh_id", &self.mesh_id)
            .field("channel", &self.channel)
            .field("max_layer", &self.max_layer)
            .field("allow_root", &self.allow_root)
            .field("password", &"<redacted>")
            .field("route_table_capacity", &self.route_table_capacity)
            .finish()
    }
}

/// `bridge:` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub queue_capacity: usize,
    pub max_packet_size: usize,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// `external_ap:` section
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalApSection {
    pub enabled: bool,
    pub ssid: String,
    pub password: String,
    pub max_connections: u8,
}

impl Default for ExternalApSection {
    fn default() -> Self {
        Self {
            enabled: false,
            ssid: "geogram".to_string(),
            password: String::new(),
            max_connections: 4,
        }
    }
}

impl std::fmt::Debug for ExternalApSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalApSection")
            .field("enabled", &self.enabled)
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<NodeConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?}, using defaults: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final mesh configuration: mesh_id={}, channel={}, max_layer={}, allow_root={}, queue={}",
            config.mesh.mesh_id,
            config.mesh.channel,
            config.mesh.max_layer,
            config.mesh.allow_root,
            config.bridge.queue_capacity
        );

        Ok(config)
    }

    /// Apply `GEOGRAM_MESH_*` overrides obtained through `lookup`.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(value) = var("ID") {
            match value.parse::<HwAddr>() {
                Ok(id) => {
                    self.mesh.mesh_id = id;
                    info!("Mesh id overridden by environment: {}", id);
                }
                Err(e) => warn!("Ignoring {}ID={}: {}", ENV_PREFIX, value, e),
            }
        }

        if let Some(value) = var("CHANNEL") {
            override_parsed(&mut self.mesh.channel, "CHANNEL", &value);
        }
        if let Some(value) = var("MAX_LAYER") {
            override_parsed(&mut self.mesh.max_layer, "MAX_LAYER", &value);
        }
        if let Some(value) = var("ALLOW_ROOT") {
            override_parsed(&mut self.mesh.allow_root, "ALLOW_ROOT", &value);
        }
        if let Some(value) = var("PASSWORD") {
            self.mesh.password = value;
            info!("Mesh password overridden by environment");
        }
        if let Some(value) = var("ROUTE_TABLE_CAPACITY") {
            override_parsed(
                &mut self.mesh.route_table_capacity,
                "ROUTE_TABLE_CAPACITY",
                &value,
            );
        }
        if let Some(value) = var("QUEUE_CAPACITY") {
            override_parsed(&mut self.bridge.queue_capacity, "QUEUE_CAPACITY", &value);
        }
        if let Some(value) = var("MAX_PACKET_SIZE") {
            override_parsed(&mut self.bridge.max_packet_size, "MAX_PACKET_SIZE", &value);
        }
        if let Some(value) = var("EXTERNAL_AP") {
            override_parsed(&mut self.external_ap.enabled, "EXTERNAL_AP", &value);
        }
        if let Some(value) = var("EXTERNAL_AP_SSID") {
            info!("External AP SSID overridden by environment: {}", value);
            self.external_ap.ssid = value;
        }
        if let Some(value) = var("EXTERNAL_AP_PASSWORD") {
            self.external_ap.password = value;
            info!("External AP password overridden by environment");
        }
    }

    /// Controller start configuration
    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            mesh_id: self.mesh.mesh_id.octets(),
            channel: self.mesh.channel,
            max_layer: self.mesh.max_layer,
            allow_root: self.mesh.allow_root,
            password: self.mesh.password.clone(),
            route_table_capacity: self.mesh.route_table_capacity,
            ..MeshConfig::default()
        }
    }

    /// Bridge configuration
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            queue_capacity: self.bridge.queue_capacity,
            max_packet_size: self.bridge.max_packet_size,
            ..BridgeConfig::default()
        }
    }
}

fn override_parsed<T>(field: &mut T, name: &str, value: &str)
where
    T: std::str::FromStr + std::fmt::Display,
{
    match value.parse::<T>() {
        Ok(parsed) => {
            info!("{} overridden by environment: {}", name, parsed);
            *field = parsed;
        }
        Err(_) => warn!("Ignoring {}{}={}: not a valid value", ENV_PREFIX, name, value),
    }
}
