//! Application-level mesh events

use mesh_routing::{HwAddr, SubnetCollision, SubnetId};
use serde::Serialize;
use std::net::Ipv4Addr;

/// Events reported to the configured [`MeshEventHandler`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    /// The transport is up and scanning
    Started {
        /// This node's subnet
        subnet_id: SubnetId,
    },
    /// The mesh was stopped
    Stopped,
    /// Attached to a parent
    Connected {
        /// Parent address
        parent: HwAddr,
        /// Layer after attaching
        layer: u8,
        /// Whether this node is root
        is_root: bool,
    },
    /// Lost the parent
    Disconnected {
        /// Reason reported by the transport
        reason: String,
    },
    /// A child attached
    ChildConnected {
        /// Child address
        addr: HwAddr,
    },
    /// A child left
    ChildDisconnected {
        /// Child address
        addr: HwAddr,
    },
    /// Root role or layer changed
    RootChanged {
        /// Whether this node is root now
        is_root: bool,
        /// Current layer
        layer: u8,
    },
    /// The route table was refreshed after a topology change
    RouteTableChanged {
        /// Nodes in the refreshed table
        node_count: usize,
    },
    /// Two or more nodes derived the same subnet id
    SubnetCollision(SubnetCollision),
    /// A station joined the external access point
    ExternalStationConnected {
        /// Station hardware address
        mac: HwAddr,
        /// Address leased to the station
        ip: Ipv4Addr,
    },
}

/// Trait for handling mesh events.
///
/// Transport-driven events arrive on the controller's event task.
/// [`MeshEvent::Stopped`] is delivered on the task calling `stop`, and
/// [`MeshEvent::SubnetCollision`] on whichever task refreshed the route
/// table, which may be a caller of `nodes` or `find_node_by_subnet`.
/// Handlers must not block and must not call back into the controller's
/// `stop`.
pub trait MeshEventHandler: Send + Sync + std::fmt::Debug {
    /// Handle one application event
    fn on_mesh_event(&self, event: &MeshEvent);
}
