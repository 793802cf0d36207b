//! Local delivery of decapsulated packets

use mesh_routing::HwAddr;
use mesh_wire::BridgeHeader;
use tracing::debug;

/// Hands a validated, decapsulated IP packet to this node's network stack.
///
/// Called on the receive dispatcher task after every check has passed, so
/// implementations must not block.
pub trait LocalDelivery: Send + Sync {
    /// Deliver one packet that arrived from `from`
    fn deliver(&self, from: HwAddr, header: &BridgeHeader, packet: &[u8]);
}

/// Delivery that only logs, for nodes without a local stack hook
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyDelivery;

impl LocalDelivery for LogOnlyDelivery {
    fn deliver(&self, from: HwAddr, header: &BridgeHeader, packet: &[u8]) {
        debug!(
            "Bridged packet from {} (subnet {}), {} bytes: local injection not configured",
            from,
            header.src_subnet,
            packet.len()
        );
    }
}
