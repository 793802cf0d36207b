//! IP subnet bridge over the mesh.
//!
//! Each node owns the /24 `192.168.(10 + subnet_id).0`. Packets addressed to
//! another node's subnet are wrapped in a bridge datagram, queued, and sent to
//! the owning node by a forwarding worker. Received bridge datagrams are
//! validated and handed to a [`LocalDelivery`] implementation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_bridge::SubnetBridge;
//! use mesh_control::MeshController;
//! use std::net::Ipv4Addr;
//!
//! # async fn example(controller: MeshController) -> Result<(), mesh_bridge::BridgeError> {
//! let bridge = SubnetBridge::with_defaults(controller);
//! bridge.enable().await?;
//!
//! let packet = [0x45u8; 60];
//! if !bridge.intercept(Ipv4Addr::new(192, 168, 48, 7), &packet) {
//!     // send on the local interface instead
//! }
//! println!("{:?}", bridge.stats());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod delivery;
pub mod error;
pub mod queue;
pub mod stats;

mod worker;

pub use bridge::{
    BridgeConfig, SubnetBridge, DEFAULT_MAX_PACKET_SIZE, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_WORKER_POLL,
};
pub use delivery::{LocalDelivery, LogOnlyDelivery};
pub use error::BridgeError;
pub use queue::{BridgeJob, OutboundQueue};
pub use stats::BridgeStats;
