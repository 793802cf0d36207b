//! Bridge errors

use mesh_control::MeshError;
use mesh_routing::SubnetId;
use mesh_wire::WireError;
use thiserror::Error;

/// Errors returned by the subnet bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Bridge or mesh in the wrong lifecycle phase
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Rejected packet or destination
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No known node owns the destination subnet
    #[error("no mesh node for subnet {0}")]
    NotFound(SubnetId),

    /// Outbound queue full, packet dropped
    #[error("outbound queue full ({capacity} packets)")]
    ResourceExhausted {
        /// Queue capacity
        capacity: usize,
    },

    /// Control plane failure
    #[error("mesh: {0}")]
    Mesh(#[from] MeshError),

    /// Framing failure
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}
