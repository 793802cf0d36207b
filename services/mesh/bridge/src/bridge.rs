//! Subnet bridge.
//!
//! Outbound packets for another node's subnet are framed and queued for the
//! forwarding worker. Inbound bridge datagrams are validated (version,
//! length, destination subnet, checksum) before local delivery. Rejected
//! datagrams are dropped and logged, never reported to the sender.

use crate::delivery::{LocalDelivery, LogOnlyDelivery};
use crate::error::BridgeError;
use crate::queue::{BridgeJob, OutboundQueue};
use crate::stats::{BridgeCounters, BridgeStats};
use crate::worker::run_worker;
use async_trait::async_trait;
use mesh_control::{
    DatagramHandler, Dispatch, HandlerId, MeshController, MeshError, StopHook, PRIORITY_BRIDGE,
    STOP_TIMEOUT,
};
use mesh_routing::SubnetId;
use mesh_transport::Datagram;
use mesh_wire::{encapsulate, BridgeFrame, MAX_BRIDGE_PAYLOAD};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default outbound queue capacity in packets
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// Default largest packet accepted for bridging
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

/// Default forwarding worker poll interval
pub const DEFAULT_WORKER_POLL: Duration = Duration::from_millis(100);

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Outbound queue capacity in packets
    pub queue_capacity: usize,
    /// Largest IP packet accepted by `forward`
    pub max_packet_size: usize,
    /// How long the worker waits for a job before rechecking its run flag
    pub worker_poll: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            worker_poll: DEFAULT_WORKER_POLL,
        }
    }
}

struct ActiveBridge {
    queue: OutboundQueue,
    handler: HandlerId,
    running: Arc<AtomicBool>,
    worker: JoinHandle<mpsc::Receiver<BridgeJob>>,
}

struct BridgeInner {
    controller: MeshController,
    config: BridgeConfig,
    delivery: Arc<dyn LocalDelivery>,
    counters: Arc<BridgeCounters>,
    enabled: AtomicBool,
    active: Mutex<Option<ActiveBridge>>,
    lifecycle: AsyncMutex<()>,
}

/// IP subnet bridge for one mesh node
#[derive(Clone)]
pub struct SubnetBridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for SubnetBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetBridge")
            .field("enabled", &self.is_enabled())
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SubnetBridge {
    /// Create a disabled bridge.
    ///
    /// The bridge disables itself whenever `controller` stops.
    pub fn new(
        controller: MeshController,
        config: BridgeConfig,
        delivery: Arc<dyn LocalDelivery>,
    ) -> Self {
        let config = BridgeConfig {
            queue_capacity: config.queue_capacity.max(1),
            max_packet_size: config.max_packet_size.min(MAX_BRIDGE_PAYLOAD),
            ..config
        };

        let inner = Arc::new(BridgeInner {
            controller,
            config,
            delivery,
            counters: Arc::new(BridgeCounters::default()),
            enabled: AtomicBool::new(false),
            active: Mutex::new(None),
            lifecycle: AsyncMutex::new(()),
        });

        let hook: Arc<dyn StopHook> = inner.clone();
        inner.controller.register_stop_hook(Arc::downgrade(&hook));

        Self { inner }
    }

    /// Bridge with default configuration and log-only delivery
    pub fn with_defaults(controller: MeshController) -> Self {
        Self::new(controller, BridgeConfig::default(), Arc::new(LogOnlyDelivery))
    }

    /// Start bridging. Requires a connected mesh; enabling twice is a no-op.
    pub async fn enable(&self) -> Result<(), BridgeError> {
        self.inner.enable().await
    }

    /// Stop bridging and discard queued packets
    pub async fn disable(&self) -> Result<(), BridgeError> {
        self.inner.disable().await
    }

    /// Whether bridging is active
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Counters since the last enable
    pub fn stats(&self) -> BridgeStats {
        self.inner.counters.snapshot()
    }

    /// Packets waiting for the forwarding worker
    pub fn queued(&self) -> usize {
        self.inner
            .active()
            .as_ref()
            .map_or(0, |active| active.queue.len())
    }

    /// Queue `packet` for the node owning `dest`'s subnet.
    ///
    /// Packets for this node's own subnet need no bridging and succeed
    /// without being queued.
    pub fn forward(&self, dest: Ipv4Addr, packet: &[u8]) -> Result<(), BridgeError> {
        let queue = self
            .inner
            .active()
            .as_ref()
            .map(|active| active.queue.clone())
            .ok_or_else(|| BridgeError::InvalidState("bridge not enabled".to_string()))?;

        if packet.is_empty() {
            return Err(BridgeError::InvalidArgument("empty packet".to_string()));
        }
        if packet.len() > self.inner.config.max_packet_size {
            return Err(BridgeError::InvalidArgument(format!(
                "packet of {} bytes exceeds {}",
                packet.len(),
                self.inner.config.max_packet_size
            )));
        }

        let dest_subnet = SubnetId::from_ipv4(dest).ok_or_else(|| {
            BridgeError::InvalidArgument(format!("{} is outside the mesh subnets", dest))
        })?;
        let own_subnet = self
            .inner
            .controller
            .subnet_id()
            .ok_or_else(|| BridgeError::Mesh(MeshError::NotConnected))?;

        if dest_subnet == own_subnet {
            debug!("Packet for {} is on the local subnet, not bridging", dest);
            return Ok(());
        }

        let node = self
            .inner
            .controller
            .find_node_by_subnet(dest_subnet)
            .ok_or_else(|| {
                warn!("No mesh node found for subnet {}", dest_subnet.get());
                BridgeError::NotFound(dest_subnet)
            })?;

        let datagram = encapsulate(own_subnet.get(), dest_subnet.get(), packet)?;
        if let Err(e) = queue.try_enqueue(BridgeJob {
            dest: node.addr,
            datagram,
        }) {
            warn!("Dropping packet for subnet {}: {}", dest_subnet.get(), e);
            return Err(e);
        }

        debug!(
            "Queued packet for subnet {} ({} bytes)",
            dest_subnet.get(),
            packet.len()
        );
        Ok(())
    }

    /// Outbound hook for the local network stack.
    ///
    /// Returns true when the packet was bridged and must not also be sent
    /// locally.
    pub fn intercept(&self, dest: Ipv4Addr, packet: &[u8]) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let Some(dest_subnet) = SubnetId::from_ipv4(dest) else {
            return false;
        };
        if Some(dest_subnet) == self.inner.controller.subnet_id() {
            return false;
        }

        match self.forward(dest, packet) {
            Ok(()) => true,
            Err(e) => {
                debug!("Not bridging packet for {}: {}", dest, e);
                false
            }
        }
    }
}

impl DatagramHandler for SubnetBridge {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn handle_datagram(&self, datagram: &Datagram) -> Dispatch {
        self.inner.handle_datagram(datagram)
    }
}

impl BridgeInner {
    fn active(&self) -> MutexGuard<'_, Option<ActiveBridge>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enable(self: &Arc<Self>) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.enabled.load(Ordering::SeqCst) {
            warn!("Bridge already enabled");
            return Ok(());
        }

        if !self.controller.is_connected() {
            error!("Cannot enable bridge: mesh not connected");
            return Err(BridgeError::InvalidState("mesh not connected".to_string()));
        }

        info!(
            "Enabling IP bridge: queue {} packets, max packet {} bytes",
            self.config.queue_capacity, self.config.max_packet_size
        );

        self.counters.reset();

        let (queue, jobs) = OutboundQueue::new(self.config.queue_capacity);
        let running = Arc::new(AtomicBool::new(true));
        let worker = tokio::spawn(run_worker(
            self.controller.clone(),
            jobs,
            running.clone(),
            self.counters.clone(),
            self.config.worker_poll,
        ));

        let handler: Arc<dyn DatagramHandler> = self.clone();
        let handler = self.controller.register_handler(PRIORITY_BRIDGE, handler);

        *self.active() = Some(ActiveBridge {
            queue,
            handler,
            running,
            worker,
        });
        self.enabled.store(true, Ordering::SeqCst);

        info!("IP bridge enabled");
        Ok(())
    }

    async fn disable(&self) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;

        let active = self.active().take();
        let Some(active) = active else {
            return Ok(());
        };

        info!("Disabling IP bridge");
        self.enabled.store(false, Ordering::SeqCst);
        self.controller.unregister_handler(active.handler);
        active.running.store(false, Ordering::SeqCst);

        let mut worker = active.worker;
        let result = match tokio::time::timeout(STOP_TIMEOUT, &mut worker).await {
            Ok(Ok(mut jobs)) => {
                jobs.close();
                let mut discarded = 0usize;
                while jobs.try_recv().is_ok() {
                    discarded += 1;
                }
                if discarded > 0 {
                    info!("Discarded {} queued bridge packets", discarded);
                }
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Bridge forwarding worker failed: {}", e);
                Ok(())
            }
            Err(_) => {
                worker.abort();
                error!(
                    "Bridge forwarding worker did not stop within {:?}",
                    STOP_TIMEOUT
                );
                Err(BridgeError::Mesh(MeshError::ShutdownTimeout {
                    task: "bridge forwarding worker",
                    timeout: STOP_TIMEOUT,
                }))
            }
        };

        info!("IP bridge disabled");
        result
    }

    fn name(&self) -> &str {
        "bridge"
    }

    fn reject(&self, datagram: &Datagram, reason: &str) -> Dispatch {
        warn!(
            "Dropping bridge datagram from {}: {}",
            datagram.from, reason
        );
        self.counters.record_dropped();
        Dispatch::Claimed
    }

    fn handle_datagram(&self, datagram: &Datagram) -> Dispatch {
        if !self.enabled.load(Ordering::SeqCst) {
            return Dispatch::NotMine;
        }

        let frame = match BridgeFrame::parse(&datagram.data) {
            Ok(frame) => frame,
            Err(e) if e.is_foreign() => {
                debug!("Not a bridge datagram from {}: {}", datagram.from, e);
                return Dispatch::NotMine;
            }
            Err(e) => return self.reject(datagram, &e.to_string()),
        };

        let header = frame.header;
        let Some(own_subnet) = self.controller.subnet_id() else {
            return self.reject(datagram, "mesh not started");
        };
        if header.dest_subnet != own_subnet.get() {
            return self.reject(
                datagram,
                &format!(
                    "not for us (dest={}, ours={})",
                    header.dest_subnet,
                    own_subnet.get()
                ),
            );
        }

        if let Err(e) = frame.verify_checksum() {
            return self.reject(datagram, &e.to_string());
        }

        self.counters.record_received(frame.payload.len());
        info!(
            "Bridge packet from {}: subnet {} -> {}, {} bytes",
            datagram.from,
            header.src_subnet,
            header.dest_subnet,
            frame.payload.len()
        );

        self.delivery.deliver(datagram.from, &header, frame.payload);
        Dispatch::Claimed
    }
}

impl DatagramHandler for BridgeInner {
    fn name(&self) -> &str {
        BridgeInner::name(self)
    }

    fn handle_datagram(&self, datagram: &Datagram) -> Dispatch {
        BridgeInner::handle_datagram(self, datagram)
    }
}

#[async_trait]
impl StopHook for BridgeInner {
    async fn on_mesh_stop(&self) {
        if let Err(e) = self.disable().await {
            error!("Failed to disable bridge on mesh stop: {}", e);
        }
    }
}
