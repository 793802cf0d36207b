//! In-process simulated mesh.
//!
//! All nodes of a [`SimMesh`] share one medium. Datagrams are delivered
//! through per-node inboxes, and topology events are pushed to whichever
//! event sender each node was started with.
//!
//! In self-organizing mode the first root-capable node to start finds no
//! parent and claims the root; every later node attaches directly below it
//! (layer 2). In manual mode only `Started`/`Stopped` are generated and tests
//! drive the state machine with [`SimMesh::inject`].
//!
//! A started node can also serve an external access point. Stations join it
//! through [`SimMesh::connect_station`].

use crate::transport::{
    Datagram, ExternalApParams, MeshTransport, StartParams, TransportError, TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use mesh_routing::HwAddr;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Layer of every node attached below the root
const CHILD_LAYER: u8 = 2;

type Outbox = Vec<(mpsc::UnboundedSender<TransportEvent>, TransportEvent)>;

#[derive(Debug)]
struct SimNode {
    inbox: mpsc::UnboundedSender<Datagram>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    started: bool,
    allow_root: bool,
    self_organized: bool,
    is_root: bool,
    layer: u8,
    parent: Option<HwAddr>,
    external_ap: Option<ExternalApParams>,
    stations: u8,
}

#[derive(Debug, Default)]
struct MeshState {
    nodes: HashMap<HwAddr, SimNode>,
    /// Started nodes in join order
    order: Vec<HwAddr>,
    root: Option<HwAddr>,
}

impl MeshState {
    fn emit(&self, outbox: &mut Outbox, addr: HwAddr, event: TransportEvent) {
        if let Some(tx) = self.nodes.get(&addr).and_then(|node| node.events.clone()) {
            outbox.push((tx, event));
        }
    }

    fn attach(&mut self, child: HwAddr, root: HwAddr, outbox: &mut Outbox) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = Some(root);
            node.layer = CHILD_LAYER;
            node.is_root = false;
        }

        debug!("Sim mesh: {} attached below {}", child, root);
        self.emit(
            outbox,
            child,
            TransportEvent::ParentConnected {
                parent: root,
                layer: CHILD_LAYER,
                is_root: false,
            },
        );
        self.emit(outbox, root, TransportEvent::ChildConnected(child));

        for other in self.order.clone() {
            if other != child && other != root {
                self.emit(outbox, other, TransportEvent::RoutingTableChanged);
            }
        }
    }

    fn become_root(&mut self, addr: HwAddr, outbox: &mut Outbox) {
        self.root = Some(addr);
        if let Some(node) = self.nodes.get_mut(&addr) {
            node.is_root = true;
            node.layer = 1;
            node.parent = None;
        }
        info!("Sim mesh: {} is root", addr);

        for other in self.order.clone() {
            let needs_attach = other != addr
                && self
                    .nodes
                    .get(&other)
                    .map_or(false, |node| node.parent != Some(addr));
            if needs_attach {
                self.attach(other, addr, outbox);
            }
        }
    }

    fn elect_root(&mut self, outbox: &mut Outbox) {
        let candidate = self.order.iter().copied().find(|addr| {
            self.nodes
                .get(addr)
                .map_or(false, |node| node.allow_root && node.self_organized)
        });

        if let Some(addr) = candidate {
            self.emit(outbox, addr, TransportEvent::NoParentFound);
            self.become_root(addr, outbox);
        }
    }
}

fn flush(outbox: Outbox) {
    for (tx, event) in outbox {
        // A closed receiver means that node's controller already went away
        let _ = tx.send(event);
    }
}

/// Shared medium connecting simulated nodes
#[derive(Debug, Clone)]
pub struct SimMesh {
    state: Arc<Mutex<MeshState>>,
    self_organizing: bool,
}

impl SimMesh {
    /// Mesh that only reports `Started`/`Stopped`; topology comes from [`SimMesh::inject`]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MeshState::default())),
            self_organizing: false,
        }
    }

    /// Mesh that elects a root and attaches nodes on its own
    pub fn self_organizing() -> Self {
        Self {
            self_organizing: true,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, MeshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a node and return its transport
    pub fn node(&self, addr: HwAddr) -> SimTransport {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let previous = self.lock().nodes.insert(
            addr,
            SimNode {
                inbox: inbox_tx,
                events: None,
                started: false,
                allow_root: true,
                self_organized: self.self_organizing,
                is_root: false,
                layer: 0,
                parent: None,
                external_ap: None,
                stations: 0,
            },
        );
        if previous.is_some() {
            warn!("Sim mesh: node {} registered twice, replacing", addr);
        }

        SimTransport {
            addr,
            mesh: self.clone(),
            inbox: AsyncMutex::new(inbox_rx),
            initialized: AtomicBool::new(false),
        }
    }

    /// Push an event to a started node as if the transport raised it.
    ///
    /// Returns false when the node is unknown or not started.
    pub fn inject(&self, addr: HwAddr, event: TransportEvent) -> bool {
        let state = self.lock();
        match state.nodes.get(&addr).and_then(|node| node.events.as_ref()) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Associate a station with `addr`'s external access point.
    ///
    /// Returns false when the access point is not running or already full.
    pub fn connect_station(&self, addr: HwAddr, mac: HwAddr, ip: Ipv4Addr) -> bool {
        let mut state = self.lock();
        let Some(node) = state.nodes.get_mut(&addr) else {
            return false;
        };
        let Some(max_connections) = node.external_ap.as_ref().map(|ap| ap.max_connections) else {
            return false;
        };
        if node.stations >= max_connections {
            debug!("Sim mesh: {} access point full, refusing {}", addr, mac);
            return false;
        }
        let Some(tx) = node.events.as_ref() else {
            return false;
        };

        node.stations += 1;
        tx.send(TransportEvent::ExternalStationConnected { mac, ip })
            .is_ok()
    }

    /// Whether `addr` is serving an external access point
    pub fn external_ap_running(&self, addr: HwAddr) -> bool {
        self.lock()
            .nodes
            .get(&addr)
            .map_or(false, |node| node.external_ap.is_some())
    }

    /// Started nodes in join order
    pub fn started_nodes(&self) -> Vec<HwAddr> {
        self.lock().order.clone()
    }

    /// Current root, if any
    pub fn root(&self) -> Option<HwAddr> {
        self.lock().root
    }
}

impl Default for SimMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of a [`SimMesh`]
#[derive(Debug)]
pub struct SimTransport {
    addr: HwAddr,
    mesh: SimMesh,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<Datagram>>,
    initialized: AtomicBool,
}

impl SimTransport {
    fn ensure_initialized(&self) -> Result<(), TransportError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotInitialized)
        }
    }

    fn is_started(&self) -> bool {
        self.mesh
            .lock()
            .nodes
            .get(&self.addr)
            .map_or(false, |node| node.started)
    }
}

#[async_trait]
impl MeshTransport for SimTransport {
    async fn init(&self) -> Result<(), TransportError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn deinit(&self) -> Result<(), TransportError> {
        if self.is_started() {
            self.stop().await?;
        }
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> HwAddr {
        self.addr
    }

    async fn start(
        &self,
        params: &StartParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        self.ensure_initialized()?;

        let mut outbox = Outbox::new();
        {
            let mut state = self.mesh.lock();
            let node = state
                .nodes
                .get_mut(&self.addr)
                .ok_or_else(|| TransportError::Other(format!("node {} not registered", self.addr)))?;

            if node.started {
                return Err(TransportError::Other(format!(
                    "node {} already started",
                    self.addr
                )));
            }
            node.started = true;
            node.events = Some(events);
            node.allow_root = params.allow_root;

            state.order.push(self.addr);
            state.emit(&mut outbox, self.addr, TransportEvent::Started);

            if self.mesh.self_organizing {
                let root = state.root;
                match root {
                    Some(root) => state.attach(self.addr, root, &mut outbox),
                    None if params.allow_root => {
                        state.emit(&mut outbox, self.addr, TransportEvent::NoParentFound);
                        state.become_root(self.addr, &mut outbox);
                    }
                    None => state.emit(&mut outbox, self.addr, TransportEvent::NoParentFound),
                }
            }
        }
        flush(outbox);

        debug!("Sim mesh: {} started", self.addr);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let mut outbox = Outbox::new();
        let events = {
            let mut state = self.mesh.lock();
            let Some(node) = state.nodes.get_mut(&self.addr) else {
                return Ok(());
            };
            if !node.started {
                return Ok(());
            }

            node.started = false;
            node.is_root = false;
            node.layer = 0;
            node.external_ap = None;
            node.stations = 0;
            let parent = node.parent.take();
            let events = node.events.take();

            state.order.retain(|addr| *addr != self.addr);

            if state.root == Some(self.addr) {
                state.root = None;
                for other in state.order.clone() {
                    if let Some(node) = state.nodes.get_mut(&other) {
                        node.parent = None;
                        node.layer = 0;
                    }
                    state.emit(
                        &mut outbox,
                        other,
                        TransportEvent::ParentDisconnected {
                            reason: "root left".to_string(),
                        },
                    );
                }
                if self.mesh.self_organizing {
                    state.elect_root(&mut outbox);
                }
            } else if let Some(parent) = parent {
                state.emit(&mut outbox, parent, TransportEvent::ChildDisconnected(self.addr));
                for other in state.order.clone() {
                    if other != parent {
                        state.emit(&mut outbox, other, TransportEvent::RoutingTableChanged);
                    }
                }
            }

            events
        };
        flush(outbox);

        if let Some(tx) = events {
            let _ = tx.send(TransportEvent::Stopped);
        }

        debug!("Sim mesh: {} stopped", self.addr);
        Ok(())
    }

    async fn send_to(&self, dest: HwAddr, data: &[u8]) -> Result<(), TransportError> {
        let state = self.mesh.lock();

        let started = state
            .nodes
            .get(&self.addr)
            .map_or(false, |node| node.started);
        if !started {
            return Err(TransportError::NotStarted);
        }

        let target = state
            .nodes
            .get(&dest)
            .filter(|node| node.started)
            .ok_or(TransportError::Unreachable(dest))?;

        target
            .inbox
            .send(Datagram {
                from: self.addr,
                data: Bytes::copy_from_slice(data),
            })
            .map_err(|_| TransportError::Unreachable(dest))
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Datagram>, TransportError> {
        self.ensure_initialized()?;

        let mut inbox = self.inbox.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(datagram)) => Ok(Some(datagram)),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }

    fn routing_table(&self) -> Vec<HwAddr> {
        if self.is_started() {
            self.mesh.started_nodes()
        } else {
            Vec::new()
        }
    }

    fn set_self_organized(&self, enabled: bool) -> Result<(), TransportError> {
        self.ensure_initialized()?;
        if let Some(node) = self.mesh.lock().nodes.get_mut(&self.addr) {
            node.self_organized = enabled;
        }
        Ok(())
    }

    fn force_root(&self) -> Result<(), TransportError> {
        if !self.is_started() {
            return Err(TransportError::NotStarted);
        }

        let mut outbox = Outbox::new();
        {
            let mut state = self.mesh.lock();
            state.become_root(self.addr, &mut outbox);
        }
        flush(outbox);
        Ok(())
    }

    fn is_root(&self) -> bool {
        self.mesh
            .lock()
            .nodes
            .get(&self.addr)
            .map_or(false, |node| node.started && node.is_root)
    }

    fn layer(&self) -> u8 {
        self.mesh
            .lock()
            .nodes
            .get(&self.addr)
            .map_or(0, |node| node.layer)
    }

    async fn start_external_ap(&self, params: &ExternalApParams) -> Result<(), TransportError> {
        let mut state = self.mesh.lock();
        let node = state
            .nodes
            .get_mut(&self.addr)
            .filter(|node| node.started)
            .ok_or(TransportError::NotStarted)?;

        node.external_ap = Some(params.clone());
        node.stations = 0;
        debug!(
            "Sim mesh: {} serving access point {} at {}",
            self.addr, params.ssid, params.gateway
        );
        Ok(())
    }

    async fn stop_external_ap(&self) -> Result<(), TransportError> {
        if let Some(node) = self.mesh.lock().nodes.get_mut(&self.addr) {
            if node.external_ap.take().is_some() {
                debug!("Sim mesh: {} access point stopped", self.addr);
            }
            node.stations = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> HwAddr {
        HwAddr([0x24, 0x6f, 0x28, 0x00, 0x00, last])
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn started(
        mesh: &SimMesh,
        last: u8,
    ) -> (SimTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let node = mesh.node(addr(last));
        let (tx, rx) = mpsc::unbounded_channel();
        node.init().await.unwrap();
        node.start(&StartParams::default(), tx).await.unwrap();
        (node, rx)
    }

    #[tokio::test]
    async fn test_start_requires_init() {
        let mesh = SimMesh::new();
        let node = mesh.node(addr(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            node.start(&StartParams::default(), tx).await,
            Err(TransportError::NotInitialized)
        );
    }

    #[tokio::test]
    async fn test_datagram_delivery() {
        let mesh = SimMesh::new();
        let (a, _a_events) = started(&mesh, 37).await;
        let (b, _b_events) = started(&mesh, 38).await;

        a.send_to(addr(38), b"hello").await.unwrap();
        let datagram = b.recv(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(datagram.from, addr(37));
        assert_eq!(&datagram.data[..], b"hello");

        assert_eq!(b.recv(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_to_unknown_or_stopped() {
        let mesh = SimMesh::new();
        let (a, _a_events) = started(&mesh, 37).await;
        let idle = mesh.node(addr(40));

        assert_eq!(
            a.send_to(addr(99), b"x").await,
            Err(TransportError::Unreachable(addr(99)))
        );
        assert_eq!(
            a.send_to(addr(40), b"x").await,
            Err(TransportError::Unreachable(addr(40)))
        );
        assert_eq!(
            idle.send_to(addr(37), b"x").await,
            Err(TransportError::NotStarted)
        );
    }

    #[tokio::test]
    async fn test_manual_mode_only_reports_lifecycle() {
        let mesh = SimMesh::new();
        let (node, mut events) = started(&mesh, 37).await;
        assert_eq!(drain(&mut events), vec![TransportEvent::Started]);

        assert!(mesh.inject(addr(37), TransportEvent::NoParentFound));
        assert!(!mesh.inject(addr(99), TransportEvent::NoParentFound));
        assert_eq!(drain(&mut events), vec![TransportEvent::NoParentFound]);

        node.stop().await.unwrap();
        assert_eq!(drain(&mut events), vec![TransportEvent::Stopped]);
        assert!(!mesh.inject(addr(37), TransportEvent::Started));
    }

    #[tokio::test]
    async fn test_self_organizing_tree() {
        let mesh = SimMesh::self_organizing();
        let (root, mut root_events) = started(&mesh, 37).await;
        assert_eq!(
            drain(&mut root_events),
            vec![TransportEvent::Started, TransportEvent::NoParentFound]
        );
        assert!(root.is_root());
        assert_eq!(root.layer(), 1);

        let (child, mut child_events) = started(&mesh, 38).await;
        assert_eq!(
            drain(&mut child_events),
            vec![
                TransportEvent::Started,
                TransportEvent::ParentConnected {
                    parent: addr(37),
                    layer: 2,
                    is_root: false
                }
            ]
        );
        assert_eq!(
            drain(&mut root_events),
            vec![TransportEvent::ChildConnected(addr(38))]
        );

        assert!(!child.is_root());
        assert_eq!(child.layer(), 2);
        assert_eq!(root.routing_table(), vec![addr(37), addr(38)]);
        assert_eq!(mesh.root(), Some(addr(37)));
    }

    #[tokio::test]
    async fn test_root_departure_elects_new_root() {
        let mesh = SimMesh::self_organizing();
        let (root, _root_events) = started(&mesh, 37).await;
        let (first, mut first_events) = started(&mesh, 38).await;
        let (_second, mut second_events) = started(&mesh, 39).await;
        drain(&mut first_events);
        drain(&mut second_events);

        root.stop().await.unwrap();

        let events = drain(&mut first_events);
        assert_eq!(
            events[0],
            TransportEvent::ParentDisconnected {
                reason: "root left".to_string()
            }
        );
        assert!(events.contains(&TransportEvent::NoParentFound));
        assert!(events.contains(&TransportEvent::ChildConnected(addr(39))));
        assert!(first.is_root());

        let events = drain(&mut second_events);
        assert!(events.contains(&TransportEvent::ParentConnected {
            parent: addr(38),
            layer: 2,
            is_root: false
        }));
        assert_eq!(mesh.root(), Some(addr(38)));
    }

    fn ap_params(max_connections: u8) -> ExternalApParams {
        ExternalApParams {
            ssid: "geogram-37".to_string(),
            password: "stationpass".to_string(),
            max_connections,
            gateway: Ipv4Addr::new(192, 168, 47, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        }
    }

    #[tokio::test]
    async fn test_external_ap_requires_started_node() {
        let mesh = SimMesh::new();
        let idle = mesh.node(addr(37));
        idle.init().await.unwrap();
        assert_eq!(
            idle.start_external_ap(&ap_params(4)).await,
            Err(TransportError::NotStarted)
        );
        assert!(!mesh.external_ap_running(addr(37)));
        assert!(!format!("{:?}", ap_params(4)).contains("stationpass"));
    }

    #[tokio::test]
    async fn test_external_ap_station_limit() {
        let mesh = SimMesh::new();
        let (node, mut events) = started(&mesh, 37).await;
        drain(&mut events);

        let station = HwAddr([0xaa, 0, 0, 0, 0, 1]);
        let ip = Ipv4Addr::new(192, 168, 47, 2);
        assert!(!mesh.connect_station(addr(37), station, ip));

        node.start_external_ap(&ap_params(1)).await.unwrap();
        assert!(mesh.external_ap_running(addr(37)));
        assert!(mesh.connect_station(addr(37), station, ip));
        assert!(!mesh.connect_station(addr(37), HwAddr([0xaa, 0, 0, 0, 0, 2]), ip));
        assert_eq!(
            drain(&mut events),
            vec![TransportEvent::ExternalStationConnected { mac: station, ip }]
        );

        // Leaving the mesh takes the access point down with it
        node.stop().await.unwrap();
        assert!(!mesh.external_ap_running(addr(37)));
        node.stop_external_ap().await.unwrap();
    }

    #[tokio::test]
    async fn test_child_departure_notifies_parent() {
        let mesh = SimMesh::self_organizing();
        let (_root, mut root_events) = started(&mesh, 37).await;
        let (child, _child_events) = started(&mesh, 38).await;
        drain(&mut root_events);

        child.stop().await.unwrap();
        assert_eq!(
            drain(&mut root_events),
            vec![TransportEvent::ChildDisconnected(addr(38))]
        );
        assert!(child.routing_table().is_empty());
    }
}
