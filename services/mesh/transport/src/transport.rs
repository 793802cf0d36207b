//! The transport collaborator interface and its event vocabulary

use async_trait::async_trait;
use bytes::Bytes;
use mesh_routing::HwAddr;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Mesh network id shared by every node of one mesh
pub const DEFAULT_MESH_ID: [u8; 6] = [0x47, 0x45, 0x4F, 0x4D, 0x53, 0x48];

/// Default radio channel
pub const DEFAULT_CHANNEL: u8 = 1;

/// Default maximum tree depth
pub const DEFAULT_MAX_LAYER: u8 = 6;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport has not been initialized
    #[error("transport not initialized")]
    NotInitialized,

    /// The transport has not been started
    #[error("transport not started")]
    NotStarted,

    /// The destination node is not reachable
    #[error("node {0} unreachable")]
    Unreachable(HwAddr),

    /// The transport was shut down underneath the caller
    #[error("transport closed")]
    Closed,

    /// Any other transport failure
    #[error("transport error: {0}")]
    Other(String),
}

/// Events reported by the transport while started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport started
    Started,
    /// The transport stopped
    Stopped,
    /// This node attached to a parent
    ParentConnected {
        /// Parent hardware address
        parent: HwAddr,
        /// Layer of this node after attaching
        layer: u8,
        /// Whether the transport reports this node as root
        is_root: bool,
    },
    /// This node lost its parent
    ParentDisconnected {
        /// Reason reported by the transport
        reason: String,
    },
    /// A child attached below this node
    ChildConnected(HwAddr),
    /// A child left
    ChildDisconnected(HwAddr),
    /// Nodes were added to or removed from the routing table
    RoutingTableChanged,
    /// This node's layer changed
    LayerChanged(u8),
    /// Scanning found no parent to attach to
    NoParentFound,
    /// A requested root switch was acknowledged
    RootSwitchAck,
    /// A station joined the external access point and was leased an address
    ExternalStationConnected {
        /// Station hardware address
        mac: HwAddr,
        /// Address leased to the station
        ip: Ipv4Addr,
    },
}

/// A datagram received from another node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Sender hardware address
    pub from: HwAddr,
    /// Datagram bytes
    pub data: Bytes,
}

/// Parameters for forming or joining a mesh
#[derive(Clone)]
pub struct StartParams {
    /// Mesh network id
    pub mesh_id: [u8; 6],
    /// Radio channel
    pub channel: u8,
    /// Maximum tree depth
    pub max_layer: u8,
    /// Whether this node may become root
    pub allow_root: bool,
    /// Mesh access password
    pub password: String,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            mesh_id: DEFAULT_MESH_ID,
            channel: DEFAULT_CHANNEL,
            max_layer: DEFAULT_MAX_LAYER,
            allow_root: true,
            password: String::new(),
        }
    }
}

impl fmt::Debug for StartParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartParams")
            .field("mesh_id", &HwAddr(self.mesh_id))
            .field("channel", &self.channel)
            .field("max_layer", &self.max_layer)
            .field("allow_root", &self.allow_root)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parameters for the external access point served next to the mesh
#[derive(Clone, PartialEq, Eq)]
pub struct ExternalApParams {
    /// Network name
    pub ssid: String,
    /// WPA2 passphrase, empty for an open network
    pub password: String,
    /// Maximum associated stations
    pub max_connections: u8,
    /// Address of the access point on its own network
    pub gateway: Ipv4Addr,
    /// Netmask handed out to stations
    pub netmask: Ipv4Addr,
}

impl fmt::Debug for ExternalApParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalApParams")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("gateway", &self.gateway)
            .field("netmask", &self.netmask)
            .finish()
    }
}

/// Mesh transport collaborator.
///
/// Implementations own tree formation and datagram delivery. Events are
/// pushed to the sender given to [`MeshTransport::start`] until
/// [`MeshTransport::stop`] returns.
#[async_trait]
pub trait MeshTransport: Send + Sync + fmt::Debug {
    /// Bring up the underlying stack
    async fn init(&self) -> Result<(), TransportError>;

    /// Tear down the underlying stack
    async fn deinit(&self) -> Result<(), TransportError>;

    /// Whether [`MeshTransport::init`] has run
    fn is_initialized(&self) -> bool;

    /// This node's hardware address
    fn local_addr(&self) -> HwAddr;

    /// Join or form a mesh and start reporting events
    async fn start(
        &self,
        params: &StartParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Leave the mesh
    async fn stop(&self) -> Result<(), TransportError>;

    /// Send a datagram to one node
    async fn send_to(&self, dest: HwAddr, data: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next datagram addressed to this node
    async fn recv(&self, timeout: Duration) -> Result<Option<Datagram>, TransportError>;

    /// Hardware addresses of every node currently reachable
    fn routing_table(&self) -> Vec<HwAddr>;

    /// Enable or disable automatic root election
    fn set_self_organized(&self, enabled: bool) -> Result<(), TransportError>;

    /// Make this node the root
    fn force_root(&self) -> Result<(), TransportError>;

    /// Whether the transport considers this node the root
    fn is_root(&self) -> bool;

    /// This node's current layer (0 when detached)
    fn layer(&self) -> u8;

    /// Bring up the external access point while the mesh is started
    async fn start_external_ap(&self, params: &ExternalApParams) -> Result<(), TransportError>;

    /// Take the external access point down
    async fn stop_external_ap(&self) -> Result<(), TransportError>;
}
