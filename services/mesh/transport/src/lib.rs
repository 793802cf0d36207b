//! Mesh transport interface and an in-process simulated mesh.
//!
//! The control plane never talks to radio hardware directly. It drives a
//! [`MeshTransport`], which forms the tree, reports topology changes as
//! [`TransportEvent`]s and moves opaque datagrams between nodes addressed by
//! their hardware address.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_routing::HwAddr;
//! use mesh_transport::{sim::SimMesh, MeshTransport, StartParams};
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), mesh_transport::TransportError> {
//! let mesh = SimMesh::self_organizing();
//! let node = mesh.node(HwAddr([0x24, 0x6f, 0x28, 0, 0, 37]));
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! node.init().await?;
//! node.start(&StartParams::default(), tx).await?;
//!
//! while let Some(event) = rx.recv().await {
//!     println!("transport event: {:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod sim;
pub mod transport;

pub use transport::{
    Datagram, ExternalApParams, MeshTransport, StartParams, TransportError, TransportEvent,
    DEFAULT_CHANNEL, DEFAULT_MAX_LAYER, DEFAULT_MESH_ID,
};
