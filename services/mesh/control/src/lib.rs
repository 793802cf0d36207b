//! Mesh control plane: role state machine, node discovery, root promotion and
//! receive dispatch.
//!
//! ## Features
//!
//! - **Role tracking**: status, root flag, layer and parent from transport events
//! - **Root promotion**: a node that finds no parent becomes root when allowed
//! - **Route table**: bounded, refreshed on topology changes, with subnet
//!   collision detection
//! - **Receive dispatch**: one loop offering inbound datagrams to protocol
//!   handlers in priority order
//! - **External access point**: optional WiFi network for non-mesh stations,
//!   served on this node's subnet
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_control::{MeshConfig, MeshController};
//! use mesh_routing::HwAddr;
//! use mesh_transport::sim::SimMesh;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), mesh_control::MeshError> {
//! let mesh = SimMesh::self_organizing();
//! let controller = MeshController::new(Arc::new(mesh.node(HwAddr([0x24, 0x6f, 0x28, 0, 0, 37]))));
//!
//! controller.init().await?;
//! controller.start(MeshConfig::default()).await?;
//! println!("subnet: {:?}", controller.subnet_id());
//! controller.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod state;

pub use config::{MeshConfig, MAX_CHANNEL, MAX_LAYER_LIMIT, MAX_PASSWORD_LEN};
pub use controller::{MeshController, StopHook, STOP_TIMEOUT};
pub use dispatch::{
    DatagramHandler, Dispatch, DispatchStats, HandlerId, HandlerRegistry, PRIORITY_BRIDGE,
    PRIORITY_PROTOCOL, RECV_ERROR_BACKOFF, RECV_TIMEOUT,
};
pub use error::MeshError;
pub use events::{MeshEvent, MeshEventHandler};
pub use state::{ExternalApStatus, MeshRoleState, MeshSnapshot, MeshStatus};
