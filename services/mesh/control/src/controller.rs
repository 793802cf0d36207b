//! Mesh control state machine.
//!
//! [`MeshController`] owns this node's role in the mesh. Transport events
//! arrive on one channel consumed by a single event task, which is the only
//! writer of role state besides `start` and `stop`. Queries are synchronous
//! reads.
//!
//! Lock order: `runtime` before `external_ap`, and `runtime` is never held
//! while role state is locked.

use crate::config::MeshConfig;
use crate::dispatch::{DatagramHandler, HandlerId, HandlerRegistry, ReceiveDispatcher};
use crate::error::MeshError;
use crate::events::{MeshEvent, MeshEventHandler};
use crate::state::{ExternalApStatus, MeshRoleState, MeshSnapshot, MeshStatus};
use async_trait::async_trait;
use mesh_routing::{HwAddr, NodeRecord, RouteTable, SubnetCollision, SubnetId};
use mesh_transport::{ExternalApParams, MeshTransport, TransportEvent};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for the receive dispatcher to exit
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest external access point SSID, in bytes
pub const MAX_SSID_LEN: usize = 32;

/// Longest external access point passphrase, in bytes
pub const MAX_AP_PASSWORD_LEN: usize = 64;

/// Work that must finish before the mesh goes down
#[async_trait]
pub trait StopHook: Send + Sync {
    /// Called at the start of [`MeshController::stop`]
    async fn on_mesh_stop(&self);
}

struct EventTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl EventTask {
    async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!("Mesh event task ended abnormally: {}", e);
        }
    }
}

#[derive(Debug, Clone)]
struct ExternalAp {
    ssid: String,
    ip: Ipv4Addr,
    max_connections: u8,
    clients: u8,
}

impl ExternalAp {
    fn status(&self) -> ExternalApStatus {
        ExternalApStatus {
            ssid: self.ssid.clone(),
            ip: self.ip,
            max_connections: self.max_connections,
            clients: self.clients,
        }
    }
}

#[derive(Default)]
struct Runtime {
    started: bool,
    event_task: Option<EventTask>,
    dispatcher: Option<ReceiveDispatcher>,
}

struct ControllerInner {
    transport: Arc<dyn MeshTransport>,
    state: RwLock<MeshRoleState>,
    routes: Mutex<RouteTable>,
    handlers: Arc<HandlerRegistry>,
    runtime: Mutex<Runtime>,
    config: RwLock<MeshConfig>,
    stop_hooks: Mutex<Vec<Weak<dyn StopHook>>>,
    collisions: Mutex<Vec<SubnetCollision>>,
    external_ap: Mutex<Option<ExternalAp>>,
    stop_timeout: Duration,
}

/// Mesh control plane for one node
#[derive(Clone)]
pub struct MeshController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for MeshController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshController")
            .field("addr", &self.local_addr())
            .field("state", &*self.inner.state())
            .finish()
    }
}

impl MeshController {
    /// Create a controller driving `transport`
    pub fn new(transport: Arc<dyn MeshTransport>) -> Self {
        Self::with_stop_timeout(transport, STOP_TIMEOUT)
    }

    /// Create a controller with a custom dispatcher stop timeout
    pub fn with_stop_timeout(transport: Arc<dyn MeshTransport>, stop_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                transport,
                state: RwLock::new(MeshRoleState::default()),
                routes: Mutex::new(RouteTable::default()),
                handlers: Arc::new(HandlerRegistry::new()),
                runtime: Mutex::new(Runtime::default()),
                config: RwLock::new(MeshConfig::default()),
                stop_hooks: Mutex::new(Vec::new()),
                collisions: Mutex::new(Vec::new()),
                external_ap: Mutex::new(None),
                stop_timeout,
            }),
        }
    }

    /// Initialize the transport
    pub async fn init(&self) -> Result<(), MeshError> {
        if self.inner.transport.is_initialized() {
            warn!("Mesh transport already initialized");
            return Ok(());
        }

        info!("Initializing mesh transport");
        self.inner.transport.init().await?;
        info!("Mesh transport initialized");
        Ok(())
    }

    /// Stop if running, then tear the transport down
    pub async fn deinit(&self) -> Result<(), MeshError> {
        if !self.inner.transport.is_initialized() {
            return Ok(());
        }

        let stopped = self.stop().await;
        self.inner.transport.deinit().await?;
        info!("Mesh transport deinitialized");
        stopped
    }

    /// Join or form the mesh
    pub async fn start(&self, config: MeshConfig) -> Result<(), MeshError> {
        config.validate()?;

        if !self.inner.transport.is_initialized() {
            error!("Cannot start mesh: transport not initialized");
            return Err(MeshError::InvalidState(
                "transport not initialized".to_string(),
            ));
        }

        {
            let mut runtime = self.inner.runtime();
            if runtime.started {
                warn!("Mesh already started");
                return Err(MeshError::InvalidState("mesh already started".to_string()));
            }
            runtime.started = true;
        }

        let addr = self.inner.transport.local_addr();
        let subnet_id = SubnetId::from_hw_addr(&addr);

        info!(
            "Starting mesh: node {}, channel {}, max layer {}, allow root {}",
            addr, config.channel, config.max_layer, config.allow_root
        );
        info!("Mesh id {}, subnet {}", HwAddr(config.mesh_id), subnet_id);

        {
            let mut state = self.inner.state_mut();
            state.reset();
            state.subnet_id = Some(subnet_id);
        }
        *self.inner.routes() = RouteTable::new(config.route_table_capacity);
        self.inner.collisions().clear();

        let params = config.start_params();
        *self.inner.config.write().unwrap_or_else(|e| e.into_inner()) = config;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_event_loop(
            self.inner.clone(),
            events_rx,
            shutdown_rx,
        ));
        self.inner.runtime().event_task = Some(EventTask {
            shutdown: shutdown_tx,
            handle,
        });

        if let Err(e) = self.inner.transport.start(&params, events_tx).await {
            error!("Mesh transport failed to start: {}", e);
            let event_task = {
                let mut runtime = self.inner.runtime();
                runtime.started = false;
                runtime.event_task.take()
            };
            if let Some(task) = event_task {
                task.shutdown().await;
            }
            self.inner.state_mut().reset();
            return Err(e.into());
        }

        Ok(())
    }

    /// Leave the mesh.
    ///
    /// Runs stop hooks, takes the external access point down, stops the
    /// receive dispatcher, stops the transport and resets all role state.
    /// A dispatcher that does not exit within the stop
    /// timeout is aborted and reported after teardown completes.
    pub async fn stop(&self) -> Result<(), MeshError> {
        let (event_task, dispatcher) = {
            let mut runtime = self.inner.runtime();
            if !runtime.started {
                return Ok(());
            }
            runtime.started = false;
            (runtime.event_task.take(), runtime.dispatcher.take())
        };

        info!("Stopping mesh");
        self.run_stop_hooks().await;

        let mut result = Ok(());

        if let Err(e) = self.shutdown_external_ap().await {
            warn!("External access point stop failed: {}", e);
            result = Err(e);
        }

        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.shutdown(self.inner.stop_timeout).await {
                error!("Receive dispatcher did not stop cleanly: {}", e);
                result = Err(e);
            }
        }

        if let Err(e) = self.inner.transport.stop().await {
            warn!("Mesh transport stop failed: {}", e);
            if result.is_ok() {
                result = Err(e.into());
            }
        }

        if let Some(task) = event_task {
            task.shutdown().await;
        }

        self.inner.state_mut().reset();
        self.inner.routes().clear();
        self.inner.collisions().clear();

        self.inner.emit(MeshEvent::Stopped);
        info!("Mesh stopped");
        result
    }

    /// Register work to run at the start of every stop
    pub fn register_stop_hook(&self, hook: Weak<dyn StopHook>) {
        let mut hooks = self.inner.stop_hooks.lock().unwrap_or_else(|e| e.into_inner());
        hooks.retain(|existing| existing.strong_count() > 0);
        hooks.push(hook);
    }

    async fn run_stop_hooks(&self) {
        let hooks: Vec<Arc<dyn StopHook>> = {
            let mut hooks = self.inner.stop_hooks.lock().unwrap_or_else(|e| e.into_inner());
            hooks.retain(|hook| hook.strong_count() > 0);
            hooks.iter().filter_map(Weak::upgrade).collect()
        };

        for hook in hooks {
            hook.on_mesh_stop().await;
        }
    }

    /// This node's hardware address
    pub fn local_addr(&self) -> HwAddr {
        self.inner.transport.local_addr()
    }

    /// Current status
    pub fn status(&self) -> MeshStatus {
        self.inner.state().status
    }

    /// Whether the node is connected or root.
    ///
    /// False as soon as `stop` begins, even while role state still shows
    /// the last connected status.
    pub fn is_connected(&self) -> bool {
        let started = self.inner.runtime().started;
        started && self.status().is_connected()
    }

    /// Whether this node is root
    pub fn is_root(&self) -> bool {
        self.inner.state().is_root
    }

    /// Hop depth from the root
    pub fn layer(&self) -> u8 {
        self.inner.state().layer
    }

    /// Subnet derived at start
    pub fn subnet_id(&self) -> Option<SubnetId> {
        self.inner.state().subnet_id
    }

    /// Current parent
    pub fn parent_address(&self) -> Option<HwAddr> {
        self.inner.state().parent
    }

    /// Full role state
    pub fn role_state(&self) -> MeshRoleState {
        *self.inner.state()
    }

    /// Refresh and return the route table
    pub fn nodes(&self) -> Vec<NodeRecord> {
        if self.is_connected() {
            self.inner.refresh_routes();
        }
        self.inner.routes().snapshot()
    }

    /// Number of known nodes as of the last refresh
    pub fn node_count(&self) -> usize {
        self.inner.routes().len()
    }

    /// Refresh the route table and find the node owning `subnet_id`
    pub fn find_node_by_subnet(&self, subnet_id: SubnetId) -> Option<NodeRecord> {
        if self.is_connected() {
            self.inner.refresh_routes();
        }
        self.inner.routes().find_by_subnet(subnet_id).cloned()
    }

    /// Status view for collaborators
    pub fn snapshot(&self) -> MeshSnapshot {
        let state = *self.inner.state();
        let nodes = self.inner.routes().snapshot();

        MeshSnapshot {
            addr: self.local_addr(),
            status: state.status,
            is_root: state.is_root,
            layer: state.layer,
            subnet_id: state.subnet_id,
            subnet: state.subnet_id.map(|subnet| subnet.to_string()),
            gateway: state.subnet_id.map(SubnetId::gateway),
            parent: state.parent,
            node_count: nodes.len(),
            nodes,
            collisions: self.inner.collisions().clone(),
            external_ap: self.inner.external_ap().as_ref().map(ExternalAp::status),
        }
    }

    /// Serve a WiFi network for non-mesh stations on this node's subnet.
    ///
    /// The access point listens on the subnet gateway address. Starting an
    /// access point that is already running succeeds without changes.
    pub async fn start_external_ap(
        &self,
        ssid: &str,
        password: &str,
        max_connections: u8,
    ) -> Result<(), MeshError> {
        if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
            return Err(MeshError::InvalidArgument(format!(
                "ssid must be 1 to {} bytes",
                MAX_SSID_LEN
            )));
        }
        if password.len() > MAX_AP_PASSWORD_LEN {
            return Err(MeshError::InvalidArgument(format!(
                "access point password longer than {} bytes",
                MAX_AP_PASSWORD_LEN
            )));
        }
        if max_connections == 0 {
            return Err(MeshError::InvalidArgument(
                "max_connections must be at least 1".to_string(),
            ));
        }

        if !self.inner.runtime().started {
            error!("Cannot start external access point: mesh not started");
            return Err(MeshError::InvalidState("mesh not started".to_string()));
        }
        if self.external_ap_is_running() {
            warn!("External access point already running");
            return Ok(());
        }
        let subnet_id = self
            .subnet_id()
            .ok_or_else(|| MeshError::InvalidState("no subnet assigned".to_string()))?;

        let params = ExternalApParams {
            ssid: ssid.to_string(),
            password: password.to_string(),
            max_connections,
            gateway: subnet_id.gateway(),
            netmask: subnet_id.netmask(),
        };

        info!("Starting external access point {}", ssid);
        self.inner.transport.start_external_ap(&params).await?;

        let stale = {
            let runtime = self.inner.runtime();
            if runtime.started {
                *self.inner.external_ap() = Some(ExternalAp {
                    ssid: params.ssid.clone(),
                    ip: params.gateway,
                    max_connections,
                    clients: 0,
                });
                false
            } else {
                true
            }
        };

        if stale {
            // stop ran while the transport was bringing the access point up
            if let Err(e) = self.inner.transport.stop_external_ap().await {
                warn!("Failed to roll back external access point: {}", e);
            }
            return Err(MeshError::InvalidState("mesh stopped".to_string()));
        }

        info!("External access point {} started at {}", ssid, params.gateway);
        Ok(())
    }

    /// Take the external access point down; a no-op when it is not running
    pub async fn stop_external_ap(&self) -> Result<(), MeshError> {
        self.shutdown_external_ap().await
    }

    async fn shutdown_external_ap(&self) -> Result<(), MeshError> {
        let running = self.inner.external_ap().take();
        let Some(ap) = running else {
            return Ok(());
        };

        info!("Stopping external access point {}", ap.ssid);
        self.inner.transport.stop_external_ap().await?;
        info!("External access point stopped");
        Ok(())
    }

    /// Whether the external access point is running
    pub fn external_ap_is_running(&self) -> bool {
        self.inner.external_ap().is_some()
    }

    /// Address of the external access point
    pub fn external_ap_ip(&self) -> Result<Ipv4Addr, MeshError> {
        self.inner
            .external_ap()
            .as_ref()
            .map(|ap| ap.ip)
            .ok_or_else(|| MeshError::InvalidState("external access point not running".to_string()))
    }

    /// Stations leased an address since the access point started
    pub fn external_ap_client_count(&self) -> u8 {
        self.inner
            .external_ap()
            .as_ref()
            .map_or(0, |ap| ap.clients)
    }

    /// Send one datagram to a node
    pub async fn send_to_node(&self, dest: HwAddr, data: &[u8]) -> Result<(), MeshError> {
        if dest.is_zero() {
            return Err(MeshError::InvalidArgument(
                "destination address is zero".to_string(),
            ));
        }
        if data.is_empty() {
            return Err(MeshError::InvalidArgument("empty payload".to_string()));
        }
        if !self.is_connected() {
            return Err(MeshError::NotConnected);
        }

        self.inner.transport.send_to(dest, data).await?;
        Ok(())
    }

    /// Register a protocol handler with the receive dispatcher
    pub fn register_handler(
        &self,
        priority: u8,
        handler: Arc<dyn DatagramHandler>,
    ) -> HandlerId {
        self.inner.handlers.register(priority, handler)
    }

    /// Remove a protocol handler
    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.inner.handlers.unregister(id)
    }
}

impl ControllerInner {
    fn state(&self) -> RwLockReadGuard<'_, MeshRoleState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, MeshRoleState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn routes(&self) -> MutexGuard<'_, RouteTable> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn collisions(&self) -> MutexGuard<'_, Vec<SubnetCollision>> {
        self.collisions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn external_ap(&self) -> MutexGuard<'_, Option<ExternalAp>> {
        self.external_ap.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn event_handler(&self) -> Option<Arc<dyn MeshEventHandler>> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .event_handler
            .clone()
    }

    fn allow_root(&self) -> bool {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .allow_root
    }

    fn emit(&self, event: MeshEvent) {
        if let Some(handler) = self.event_handler() {
            handler.on_mesh_event(&event);
        }
    }

    fn ensure_dispatcher(&self) {
        let mut runtime = self.runtime();
        if !runtime.started || runtime.dispatcher.is_some() {
            return;
        }
        runtime.dispatcher = Some(ReceiveDispatcher::spawn(
            self.transport.clone(),
            self.handlers.clone(),
        ));
    }

    /// Replace the route table from the transport and check for collisions
    fn refresh_routes(&self) -> usize {
        let addrs = self.transport.routing_table();
        let local_addr = self.transport.local_addr();
        let subnet_id = self.state().subnet_id;

        let (count, collisions) = {
            let mut routes = self.routes();
            routes.replace(addrs);
            let collisions = subnet_id
                .map(|subnet| routes.collisions(local_addr, subnet))
                .unwrap_or_default();
            (routes.len(), collisions)
        };

        self.report_collisions(collisions);
        count
    }

    fn report_collisions(&self, current: Vec<SubnetCollision>) {
        let fresh: Vec<SubnetCollision> = {
            let mut known = self.collisions();
            if *known == current {
                return;
            }
            let fresh = current
                .iter()
                .filter(|collision| !known.contains(collision))
                .cloned()
                .collect();
            *known = current;
            fresh
        };

        for collision in fresh {
            let nodes: Vec<String> = collision.nodes.iter().map(ToString::to_string).collect();
            if collision.involves_local {
                warn!(
                    "Subnet collision: this node shares {} with {}",
                    collision.subnet_id,
                    nodes.join(", ")
                );
            } else {
                warn!(
                    "Subnet collision: {} claimed by {}",
                    collision.subnet_id,
                    nodes.join(", ")
                );
            }
            self.emit(MeshEvent::SubnetCollision(collision));
        }
    }

    fn apply(&self, event: TransportEvent) {
        match event {
            TransportEvent::Started => {
                info!("Mesh started, scanning for network");
                let subnet_id = {
                    let mut state = self.state_mut();
                    state.status = MeshStatus::Started;
                    state.subnet_id
                };
                if let Some(subnet_id) = subnet_id {
                    self.emit(MeshEvent::Started { subnet_id });
                }
            }

            TransportEvent::Stopped => {
                info!("Mesh transport stopped");
                let mut state = self.state_mut();
                state.status = MeshStatus::Stopped;
                state.is_root = false;
                state.layer = 0;
            }

            TransportEvent::ParentConnected {
                parent,
                layer,
                is_root,
            } => {
                let subnet_id = {
                    let mut state = self.state_mut();
                    state.layer = layer;
                    state.is_root = is_root;
                    state.parent = Some(parent);
                    state.status = if is_root {
                        MeshStatus::Root
                    } else {
                        MeshStatus::Connected
                    };
                    state.subnet_id
                };

                info!(
                    "Connected to mesh: parent {}, layer {}, root {}",
                    parent, layer, is_root
                );
                if let Some(subnet_id) = subnet_id {
                    info!("Serving subnet {}", subnet_id);
                }

                self.ensure_dispatcher();
                self.refresh_routes();
                self.emit(MeshEvent::Connected {
                    parent,
                    layer,
                    is_root,
                });
            }

            TransportEvent::ParentDisconnected { reason } => {
                {
                    let mut state = self.state_mut();
                    if state.is_standalone_root() {
                        debug!("Ignoring parent disconnect while root: {}", reason);
                        return;
                    }
                    state.status = MeshStatus::Disconnected;
                    state.parent = None;
                    state.layer = 0;
                }

                warn!("Parent disconnected: {}", reason);
                self.emit(MeshEvent::Disconnected { reason });
            }

            TransportEvent::NoParentFound => {
                if !self.allow_root() {
                    info!("No parent found, root promotion disabled, still scanning");
                    return;
                }

                info!("No parent found, promoting this node to root");
                if let Err(e) = self.transport.set_self_organized(false) {
                    warn!("Failed to disable self-organization: {}", e);
                }
                if let Err(e) = self.transport.force_root() {
                    error!("Root promotion failed: {}", e);
                    return;
                }

                {
                    let mut state = self.state_mut();
                    state.is_root = true;
                    state.layer = 1;
                    state.status = MeshStatus::Root;
                    state.parent = None;
                }

                self.ensure_dispatcher();
                self.refresh_routes();
                self.emit(MeshEvent::RootChanged {
                    is_root: true,
                    layer: 1,
                });
            }

            TransportEvent::ChildConnected(addr) => {
                info!("Child connected: {}", addr);
                let count = self.refresh_routes();
                info!("Route table now has {} nodes", count);
                self.emit(MeshEvent::ChildConnected { addr });
            }

            TransportEvent::ChildDisconnected(addr) => {
                warn!("Child disconnected: {}", addr);
                let count = self.refresh_routes();
                info!("Route table now has {} nodes", count);
                self.emit(MeshEvent::ChildDisconnected { addr });
            }

            TransportEvent::RoutingTableChanged => {
                let node_count = self.refresh_routes();
                debug!("Routing table changed: {} nodes", node_count);
                self.emit(MeshEvent::RouteTableChanged { node_count });
            }

            TransportEvent::LayerChanged(layer) => {
                self.state_mut().layer = layer;
                info!("Layer changed to {}", layer);
            }

            TransportEvent::RootSwitchAck => {
                let is_root = self.transport.is_root();
                let layer = self.transport.layer();
                {
                    let mut state = self.state_mut();
                    state.is_root = is_root;
                    state.layer = layer;
                    state.status = if is_root {
                        MeshStatus::Root
                    } else {
                        MeshStatus::Connected
                    };
                }

                info!("Root status changed: root {}, layer {}", is_root, layer);
                self.emit(MeshEvent::RootChanged { is_root, layer });
            }

            TransportEvent::ExternalStationConnected { mac, ip } => {
                let clients = {
                    let mut external_ap = self.external_ap();
                    let Some(ap) = external_ap.as_mut() else {
                        debug!("Ignoring station {} without an external access point", mac);
                        return;
                    };
                    ap.clients = ap.clients.saturating_add(1);
                    ap.clients
                };

                info!(
                    "Station {} joined the external access point with {} ({} clients)",
                    mac, ip, clients
                );
                self.emit(MeshEvent::ExternalStationConnected { mac, ip });
            }
        }
    }
}

async fn run_event_loop(
    inner: Arc<ControllerInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    debug!("Mesh event task started");

    loop {
        tokio::select! {
            biased;

            event = events.recv() => match event {
                Some(event) => inner.apply(event),
                None => break,
            },

            _ = &mut shutdown => break,
        }
    }

    debug!("Mesh event task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatch, PRIORITY_BRIDGE, PRIORITY_PROTOCOL};
    use mesh_transport::sim::{SimMesh, SimTransport};
    use mesh_transport::{Datagram, StartParams, TransportError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(last: u8) -> HwAddr {
        HwAddr([0x24, 0x6f, 0x28, 0x00, 0x00, last])
    }

    #[derive(Debug, Default)]
    struct RecordingHandler {
        events: Mutex<Vec<MeshEvent>>,
    }

    impl RecordingHandler {
        fn events(&self) -> Vec<MeshEvent> {
            self.events.lock().unwrap().clone()
        }

        fn contains(&self, wanted: &MeshEvent) -> bool {
            self.events.lock().unwrap().contains(wanted)
        }
    }

    impl MeshEventHandler for RecordingHandler {
        fn on_mesh_event(&self, event: &MeshEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn controller(mesh: &SimMesh, last: u8) -> MeshController {
        let controller = MeshController::new(Arc::new(mesh.node(addr(last))));
        controller.init().await.unwrap();
        controller
    }

    #[tokio::test]
    async fn test_start_requires_init() {
        let mesh = SimMesh::new();
        let controller = MeshController::new(Arc::new(mesh.node(addr(37))));
        assert!(matches!(
            controller.start(MeshConfig::default()).await,
            Err(MeshError::InvalidState(_))
        ));
        assert_eq!(controller.status(), MeshStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mesh = SimMesh::new();
        let controller = controller(&mesh, 37).await;
        let config = MeshConfig {
            channel: 0,
            ..Default::default()
        };
        assert!(matches!(
            controller.start(config).await,
            Err(MeshError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let mesh = SimMesh::new();
        let controller = controller(&mesh, 37).await;
        controller.start(MeshConfig::default()).await.unwrap();
        assert!(matches!(
            controller.start(MeshConfig::default()).await,
            Err(MeshError::InvalidState(_))
        ));
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_subnet_derived_from_address() {
        let mesh = SimMesh::new();
        let controller = controller(&mesh, 37).await;
        assert_eq!(controller.subnet_id(), None);

        controller.start(MeshConfig::default()).await.unwrap();
        assert_eq!(controller.subnet_id(), SubnetId::new(37));
        wait_for(|| controller.status() == MeshStatus::Started).await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.subnet.as_deref(), Some("192.168.47.0/24"));
        assert_eq!(
            snapshot.gateway,
            Some(std::net::Ipv4Addr::new(192, 168, 47, 1))
        );

        controller.stop().await.unwrap();
        assert_eq!(controller.subnet_id(), None);
    }

    #[tokio::test]
    async fn test_no_parent_found_promotes_to_root() {
        let mesh = SimMesh::new();
        let recorder = Arc::new(RecordingHandler::default());
        let controller = controller(&mesh, 37).await;
        controller
            .start(MeshConfig::default().with_event_handler(recorder.clone()))
            .await
            .unwrap();

        assert!(mesh.inject(addr(37), TransportEvent::NoParentFound));
        wait_for(|| controller.status() == MeshStatus::Root).await;
        assert!(controller.is_root());
        assert_eq!(controller.layer(), 1);
        assert_eq!(controller.parent_address(), None);
        assert_eq!(mesh.root(), Some(addr(37)));

        // Roots have no parent, so a parent loss report is spurious
        mesh.inject(
            addr(37),
            TransportEvent::ParentDisconnected {
                reason: "beacon timeout".to_string(),
            },
        );
        mesh.inject(addr(37), TransportEvent::RoutingTableChanged);
        wait_for(|| recorder.contains(&MeshEvent::RouteTableChanged { node_count: 1 })).await;

        assert_eq!(controller.status(), MeshStatus::Root);
        assert!(controller.is_root());
        assert_eq!(controller.layer(), 1);
        assert!(!recorder
            .events()
            .iter()
            .any(|event| matches!(event, MeshEvent::Disconnected { .. })));

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_parent_found_without_root_permission() {
        let mesh = SimMesh::new();
        let recorder = Arc::new(RecordingHandler::default());
        let controller = controller(&mesh, 37).await;
        let config = MeshConfig {
            allow_root: false,
            ..Default::default()
        }
        .with_event_handler(recorder.clone());
        controller.start(config).await.unwrap();

        mesh.inject(addr(37), TransportEvent::NoParentFound);
        mesh.inject(addr(37), TransportEvent::LayerChanged(0));
        mesh.inject(addr(37), TransportEvent::RoutingTableChanged);
        wait_for(|| {
            recorder
                .events()
                .iter()
                .any(|event| matches!(event, MeshEvent::RouteTableChanged { .. }))
        })
        .await;

        assert_eq!(controller.status(), MeshStatus::Started);
        assert!(!controller.is_root());
        assert_eq!(mesh.root(), None);

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_connect_and_disconnect() {
        let mesh = SimMesh::new();
        let recorder = Arc::new(RecordingHandler::default());
        let controller = controller(&mesh, 38).await;
        controller
            .start(MeshConfig::default().with_event_handler(recorder.clone()))
            .await
            .unwrap();

        mesh.inject(
            addr(38),
            TransportEvent::ParentConnected {
                parent: addr(37),
                layer: 2,
                is_root: false,
            },
        );
        wait_for(|| controller.status() == MeshStatus::Connected).await;
        assert_eq!(controller.layer(), 2);
        assert_eq!(controller.parent_address(), Some(addr(37)));
        assert!(controller.is_connected());

        mesh.inject(addr(38), TransportEvent::LayerChanged(3));
        wait_for(|| controller.layer() == 3).await;

        mesh.inject(
            addr(38),
            TransportEvent::ParentDisconnected {
                reason: "parent left".to_string(),
            },
        );
        wait_for(|| controller.status() == MeshStatus::Disconnected).await;
        assert_eq!(controller.parent_address(), None);
        assert_eq!(controller.layer(), 0);
        assert!(recorder.contains(&MeshEvent::Disconnected {
            reason: "parent left".to_string()
        }));

        controller.stop().await.unwrap();
        assert_eq!(controller.status(), MeshStatus::Stopped);
        assert_eq!(recorder.events().last(), Some(&MeshEvent::Stopped));
    }

    #[tokio::test]
    async fn test_root_switch_ack_reads_transport() {
        let mesh = SimMesh::new();
        let controller = controller(&mesh, 38).await;
        controller.start(MeshConfig::default()).await.unwrap();

        mesh.inject(
            addr(38),
            TransportEvent::ParentConnected {
                parent: addr(37),
                layer: 2,
                is_root: false,
            },
        );
        wait_for(|| controller.status() == MeshStatus::Connected).await;

        mesh.inject(addr(38), TransportEvent::RootSwitchAck);
        // The manual sim does not move roles on its own
        mesh.inject(addr(38), TransportEvent::LayerChanged(9));
        wait_for(|| controller.layer() == 9).await;
        assert!(!controller.is_root());
        assert_eq!(controller.status(), MeshStatus::Connected);

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_node_validation() {
        let mesh = SimMesh::new();
        let controller = controller(&mesh, 37).await;
        controller.start(MeshConfig::default()).await.unwrap();

        assert!(matches!(
            controller.send_to_node(HwAddr::ZERO, b"x").await,
            Err(MeshError::InvalidArgument(_))
        ));
        assert!(matches!(
            controller.send_to_node(addr(38), b"").await,
            Err(MeshError::InvalidArgument(_))
        ));
        assert_eq!(
            controller.send_to_node(addr(38), b"x").await,
            Err(MeshError::NotConnected)
        );

        mesh.inject(addr(37), TransportEvent::NoParentFound);
        wait_for(|| controller.is_connected()).await;
        assert_eq!(
            controller.send_to_node(addr(38), b"x").await,
            Err(MeshError::Transport(TransportError::Unreachable(addr(38))))
        );

        controller.stop().await.unwrap();
    }

    struct CountingHandler {
        name: &'static str,
        prefix: &'static [u8],
        count: AtomicUsize,
    }

    impl DatagramHandler for CountingHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn handle_datagram(&self, datagram: &Datagram) -> Dispatch {
            if datagram.data.starts_with(self.prefix) {
                self.count.fetch_add(1, Ordering::SeqCst);
                Dispatch::Claimed
            } else {
                Dispatch::NotMine
            }
        }
    }

    #[tokio::test]
    async fn test_self_organizing_mesh_dispatches_datagrams() {
        let mesh = SimMesh::self_organizing();
        let root = controller(&mesh, 37).await;
        let leaf = controller(&mesh, 38).await;

        let chat = Arc::new(CountingHandler {
            name: "chat",
            prefix: b"CHAT",
            count: AtomicUsize::new(0),
        });
        let catch_all = Arc::new(CountingHandler {
            name: "catch-all",
            prefix: b"",
            count: AtomicUsize::new(0),
        });
        root.register_handler(PRIORITY_BRIDGE, catch_all.clone());
        root.register_handler(PRIORITY_PROTOCOL, chat.clone());

        root.start(MeshConfig::default()).await.unwrap();
        wait_for(|| root.status() == MeshStatus::Root).await;

        leaf.start(MeshConfig::default()).await.unwrap();
        wait_for(|| leaf.status() == MeshStatus::Connected).await;
        assert_eq!(leaf.parent_address(), Some(addr(37)));
        assert_eq!(leaf.layer(), 2);

        wait_for(|| root.node_count() == 2).await;
        let found = root.find_node_by_subnet(SubnetId::new(38).unwrap()).unwrap();
        assert_eq!(found.addr, addr(38));
        assert_eq!(found.layer, None);

        leaf.send_to_node(addr(37), b"CHAT:hello").await.unwrap();
        leaf.send_to_node(addr(37), b"something else").await.unwrap();
        wait_for(|| catch_all.count.load(Ordering::SeqCst) == 1).await;
        assert_eq!(chat.count.load(Ordering::SeqCst), 1);

        leaf.stop().await.unwrap();
        root.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_subnet_collision_reported_once() {
        let mesh = SimMesh::self_organizing();
        let recorder = Arc::new(RecordingHandler::default());
        let root = controller(&mesh, 5).await;
        root.start(MeshConfig::default().with_event_handler(recorder.clone()))
            .await
            .unwrap();
        wait_for(|| root.is_root()).await;

        // 245 % 240 == 5
        let twin = controller(&mesh, 245).await;
        twin.start(MeshConfig::default()).await.unwrap();
        wait_for(|| {
            recorder
                .events()
                .iter()
                .any(|event| matches!(event, MeshEvent::SubnetCollision(_)))
        })
        .await;

        let _ = root.nodes();
        let _ = root.nodes();

        let collisions: Vec<SubnetCollision> = recorder
            .events()
            .into_iter()
            .filter_map(|event| match event {
                MeshEvent::SubnetCollision(collision) => Some(collision),
                _ => None,
            })
            .collect();
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].subnet_id, SubnetId::new(5).unwrap());
        assert!(collisions[0].involves_local);
        assert_eq!(collisions[0].nodes, vec![addr(5), addr(245)]);
        assert_eq!(root.snapshot().collisions.len(), 1);

        twin.stop().await.unwrap();
        root.stop().await.unwrap();
    }

    struct RecordingHook {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StopHook for RecordingHook {
        async fn on_mesh_stop(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_stop_runs_hooks_and_resets() {
        let mesh = SimMesh::new();
        let controller = controller(&mesh, 37).await;
        let hook = Arc::new(RecordingHook {
            calls: AtomicUsize::new(0),
        });
        let dyn_hook: Arc<dyn StopHook> = hook.clone();
        controller.register_stop_hook(Arc::downgrade(&dyn_hook));

        // Stopping an idle mesh is a no-op
        controller.stop().await.unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);

        controller.start(MeshConfig::default()).await.unwrap();
        mesh.inject(addr(37), TransportEvent::NoParentFound);
        wait_for(|| controller.is_root()).await;

        controller.stop().await.unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.role_state(), MeshRoleState::default());
        assert_eq!(controller.node_count(), 0);

        // Restart after stop
        controller.start(MeshConfig::default()).await.unwrap();
        wait_for(|| controller.status() == MeshStatus::Started).await;
        controller.deinit().await.unwrap();
        assert_eq!(controller.status(), MeshStatus::Stopped);
    }

    /// Holds `stop` inside the hook phase until released
    struct BlockingHook {
        entered: Mutex<Option<oneshot::Sender<()>>>,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl StopHook for BlockingHook {
        async fn on_mesh_stop(&self) {
            let entered = self.entered.lock().unwrap().take();
            if let Some(entered) = entered {
                let _ = entered.send(());
            }
            self.release.notified().await;
        }
    }

    #[tokio::test]
    async fn test_not_connected_once_stop_begins() {
        let mesh = SimMesh::new();
        let controller = controller(&mesh, 37).await;
        let (entered_tx, entered_rx) = oneshot::channel();
        let hook = Arc::new(BlockingHook {
            entered: Mutex::new(Some(entered_tx)),
            release: tokio::sync::Notify::new(),
        });
        let dyn_hook: Arc<dyn StopHook> = hook.clone();
        controller.register_stop_hook(Arc::downgrade(&dyn_hook));

        controller.start(MeshConfig::default()).await.unwrap();
        mesh.inject(addr(37), TransportEvent::NoParentFound);
        wait_for(|| controller.is_connected()).await;

        let stopping = tokio::spawn({
            let controller = controller.clone();
            async move { controller.stop().await }
        });
        entered_rx.await.unwrap();

        // Role state is only reset at the end of stop
        assert_eq!(controller.status(), MeshStatus::Root);
        assert!(!controller.is_connected());
        assert_eq!(
            controller.send_to_node(addr(38), b"x").await,
            Err(MeshError::NotConnected)
        );

        hook.release.notify_one();
        stopping.await.unwrap().unwrap();
        assert_eq!(controller.status(), MeshStatus::Stopped);
    }

    #[tokio::test]
    async fn test_external_ap_lifecycle() {
        let mesh = SimMesh::new();
        let recorder = Arc::new(RecordingHandler::default());
        let controller = controller(&mesh, 37).await;
        let station = HwAddr([0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01]);
        let station_ip = Ipv4Addr::new(192, 168, 47, 2);

        assert!(matches!(
            controller.start_external_ap("geogram", "", 4).await,
            Err(MeshError::InvalidState(_))
        ));
        assert!(matches!(
            controller.external_ap_ip(),
            Err(MeshError::InvalidState(_))
        ));

        controller
            .start(MeshConfig::default().with_event_handler(recorder.clone()))
            .await
            .unwrap();
        assert!(matches!(
            controller.start_external_ap("", "", 4).await,
            Err(MeshError::InvalidArgument(_))
        ));
        assert!(matches!(
            controller.start_external_ap("geogram", "", 0).await,
            Err(MeshError::InvalidArgument(_))
        ));

        // Stations are ignored while no access point is up
        mesh.inject(
            addr(37),
            TransportEvent::ExternalStationConnected {
                mac: station,
                ip: station_ip,
            },
        );
        mesh.inject(addr(37), TransportEvent::RoutingTableChanged);
        wait_for(|| recorder.contains(&MeshEvent::RouteTableChanged { node_count: 1 })).await;
        assert_eq!(controller.external_ap_client_count(), 0);
        assert!(!recorder
            .events()
            .iter()
            .any(|event| matches!(event, MeshEvent::ExternalStationConnected { .. })));

        controller.start_external_ap("geogram", "letmein1", 2).await.unwrap();
        assert!(controller.external_ap_is_running());
        assert!(mesh.external_ap_running(addr(37)));
        assert_eq!(
            controller.external_ap_ip(),
            Ok(Ipv4Addr::new(192, 168, 47, 1))
        );
        assert_eq!(controller.external_ap_client_count(), 0);

        controller.start_external_ap("other", "", 8).await.unwrap();
        assert_eq!(controller.snapshot().external_ap.unwrap().ssid, "geogram");

        assert!(mesh.connect_station(addr(37), station, station_ip));
        wait_for(|| controller.external_ap_client_count() == 1).await;
        let connected = MeshEvent::ExternalStationConnected {
            mac: station,
            ip: station_ip,
        };
        assert_eq!(
            recorder
                .events()
                .iter()
                .filter(|event| **event == connected)
                .count(),
            1
        );

        let status = controller.snapshot().external_ap.unwrap();
        assert_eq!(status.ip, Ipv4Addr::new(192, 168, 47, 1));
        assert_eq!(status.max_connections, 2);
        assert_eq!(status.clients, 1);

        controller.stop_external_ap().await.unwrap();
        assert!(!controller.external_ap_is_running());
        assert_eq!(controller.external_ap_client_count(), 0);
        controller.stop_external_ap().await.unwrap();

        // Leaving the mesh takes a running access point down
        controller.start_external_ap("geogram", "", 1).await.unwrap();
        controller.stop().await.unwrap();
        assert!(!controller.external_ap_is_running());
        assert!(!mesh.external_ap_running(addr(37)));
        assert_eq!(controller.snapshot().external_ap, None);
    }

    /// Transport whose receive never returns
    #[derive(Debug)]
    struct StuckTransport(SimTransport);

    #[async_trait]
    impl MeshTransport for StuckTransport {
        async fn init(&self) -> Result<(), TransportError> {
            self.0.init().await
        }

        async fn deinit(&self) -> Result<(), TransportError> {
            self.0.deinit().await
        }

        fn is_initialized(&self) -> bool {
            self.0.is_initialized()
        }

        fn local_addr(&self) -> HwAddr {
            self.0.local_addr()
        }

        async fn start(
            &self,
            params: &StartParams,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<(), TransportError> {
            self.0.start(params, events).await
        }

        async fn stop(&self) -> Result<(), TransportError> {
            self.0.stop().await
        }

        async fn send_to(&self, dest: HwAddr, data: &[u8]) -> Result<(), TransportError> {
            self.0.send_to(dest, data).await
        }

        async fn recv(&self, _timeout: Duration) -> Result<Option<Datagram>, TransportError> {
            std::future::pending().await
        }

        fn routing_table(&self) -> Vec<HwAddr> {
            self.0.routing_table()
        }

        fn set_self_organized(&self, enabled: bool) -> Result<(), TransportError> {
            self.0.set_self_organized(enabled)
        }

        fn force_root(&self) -> Result<(), TransportError> {
            self.0.force_root()
        }

        fn is_root(&self) -> bool {
            self.0.is_root()
        }

        fn layer(&self) -> u8 {
            self.0.layer()
        }

        async fn start_external_ap(
            &self,
            params: &ExternalApParams,
        ) -> Result<(), TransportError> {
            self.0.start_external_ap(params).await
        }

        async fn stop_external_ap(&self) -> Result<(), TransportError> {
            self.0.stop_external_ap().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_dispatcher_is_reported() {
        let mesh = SimMesh::new();
        let controller =
            MeshController::new(Arc::new(StuckTransport(mesh.node(addr(37)))));
        controller.init().await.unwrap();
        controller.start(MeshConfig::default()).await.unwrap();

        mesh.inject(addr(37), TransportEvent::NoParentFound);
        wait_for(|| controller.is_root()).await;

        let result = controller.stop().await;
        assert_eq!(
            result,
            Err(MeshError::ShutdownTimeout {
                task: "receive dispatcher",
                timeout: STOP_TIMEOUT,
            })
        );
        assert_eq!(controller.status(), MeshStatus::Stopped);
        assert!(!controller.is_root());
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let mesh = SimMesh::new();
        let controller = controller(&mesh, 37).await;
        controller.start(MeshConfig::default()).await.unwrap();
        mesh.inject(addr(37), TransportEvent::NoParentFound);
        wait_for(|| controller.is_root()).await;

        let json = serde_json::to_value(controller.snapshot()).unwrap();
        assert_eq!(json["status"], "root");
        assert_eq!(json["addr"], "24:6f:28:00:00:25");
        assert_eq!(json["subnet_id"], 37);
        assert_eq!(json["layer"], 1);
        assert_eq!(json["node_count"], 1);

        controller.stop().await.unwrap();
    }
}
