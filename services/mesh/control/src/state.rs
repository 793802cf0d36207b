//! Role state and status snapshots

use mesh_routing::{HwAddr, NodeRecord, SubnetCollision, SubnetId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Mesh connectivity status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshStatus {
    /// Not participating
    #[default]
    Stopped,
    /// Started and scanning for a parent
    Started,
    /// Attached below a parent
    Connected,
    /// Top of the tree
    Root,
    /// Lost the parent
    Disconnected,
}

impl MeshStatus {
    /// Whether datagrams can be exchanged
    pub fn is_connected(self) -> bool {
        matches!(self, MeshStatus::Connected | MeshStatus::Root)
    }
}

impl fmt::Display for MeshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeshStatus::Stopped => "stopped",
            MeshStatus::Started => "started",
            MeshStatus::Connected => "connected",
            MeshStatus::Root => "root",
            MeshStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Role of this node in the mesh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshRoleState {
    /// Connectivity status
    pub status: MeshStatus,
    /// Whether this node is root
    pub is_root: bool,
    /// Hop depth from the root, 0 when detached
    pub layer: u8,
    /// Subnet derived at start, `None` while stopped
    pub subnet_id: Option<SubnetId>,
    /// Current parent
    pub parent: Option<HwAddr>,
}

impl MeshRoleState {
    /// Back to stopped, non-root, layer 0
    pub fn reset(&mut self) {
        *self = MeshRoleState::default();
    }

    /// Root with no parent, where parent-loss reports are meaningless
    pub fn is_standalone_root(&self) -> bool {
        self.status == MeshStatus::Root && self.parent.is_none()
    }
}

/// Point-in-time view of the mesh for status collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSnapshot {
    /// This node's address
    pub addr: HwAddr,
    /// Connectivity status
    pub status: MeshStatus,
    /// Whether this node is root
    pub is_root: bool,
    /// Current layer
    pub layer: u8,
    /// This node's subnet id
    pub subnet_id: Option<SubnetId>,
    /// This node's subnet in CIDR notation
    pub subnet: Option<String>,
    /// Gateway address this node serves on its subnet
    pub gateway: Option<Ipv4Addr>,
    /// Current parent
    pub parent: Option<HwAddr>,
    /// Number of known nodes
    pub node_count: usize,
    /// Known nodes
    pub nodes: Vec<NodeRecord>,
    /// Subnet collisions seen on the last refresh
    pub collisions: Vec<SubnetCollision>,
    /// External access point, when running
    pub external_ap: Option<ExternalApStatus>,
}

/// External access point as seen by status collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalApStatus {
    /// Network name
    pub ssid: String,
    /// Access point address, the gateway of this node's subnet
    pub ip: Ipv4Addr,
    /// Maximum associated stations
    pub max_connections: u8,
    /// Stations that were leased an address since the access point started
    pub clients: u8,
}
