//! Control plane errors

use mesh_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the mesh control plane
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Operation not allowed in the current lifecycle phase
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Rejected input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The mesh is neither connected nor root
    #[error("mesh not connected")]
    NotConnected,

    /// Transport failure
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// A background task did not exit in time and was aborted
    #[error("{task} did not exit within {timeout:?}")]
    ShutdownTimeout {
        /// Task name
        task: &'static str,
        /// How long stop waited
        timeout: Duration,
    },
}
