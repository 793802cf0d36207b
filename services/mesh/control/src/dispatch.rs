//! Receive dispatcher and protocol handler registry.
//!
//! The dispatcher is the single consumer of inbound datagrams. Each datagram
//! is offered to registered handlers in ascending priority order until one
//! claims it; foreign payloads must be declined silently.

use mesh_transport::{Datagram, MeshTransport, TransportError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::MeshError;

/// Priority for chat and other small protocols, tried first
pub const PRIORITY_PROTOCOL: u8 = 10;

/// Priority of the subnet bridge
pub const PRIORITY_BRIDGE: u8 = 100;

/// How long one receive call may block
pub const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause after a failed receive
pub const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A handler's verdict on one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The handler consumed the datagram, stop offering it
    Claimed,
    /// Not this handler's protocol
    NotMine,
}

/// Protocol demultiplexer fed by the receive dispatcher
pub trait DatagramHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Inspect one inbound datagram.
    ///
    /// Runs on the dispatcher task, so it must not block.
    fn handle_datagram(&self, datagram: &Datagram) -> Dispatch;
}

/// Registration handle returned by [`HandlerRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

struct HandlerEntry {
    id: HandlerId,
    priority: u8,
    handler: Arc<dyn DatagramHandler>,
}

/// Ordered set of protocol handlers
pub struct HandlerRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<HandlerEntry>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        f.debug_list()
            .entries(
                entries
                    .iter()
                    .map(|entry| (entry.priority, entry.handler.name().to_string())),
            )
            .finish()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Add a handler; equal priorities keep registration order
    pub fn register(&self, priority: u8, handler: Arc<dyn DatagramHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(
            "Registering datagram handler '{}' at priority {}",
            handler.name(),
            priority
        );

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push(HandlerEntry {
            id,
            priority,
            handler,
        });
        entries.sort_by_key(|entry| (entry.priority, entry.id));
        id
    }

    /// Remove a handler, returning whether it was registered
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer a datagram to each handler in order, returning the claimant
    pub fn dispatch(&self, datagram: &Datagram) -> Option<HandlerId> {
        // Handlers run without the lock so they may (un)register others
        let handlers: Vec<(HandlerId, Arc<dyn DatagramHandler>)> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| (entry.id, entry.handler.clone()))
            .collect();

        for (id, handler) in handlers {
            if handler.handle_datagram(datagram) == Dispatch::Claimed {
                debug!(
                    "Datagram from {} ({} bytes) claimed by '{}'",
                    datagram.from,
                    datagram.data.len(),
                    handler.name()
                );
                return Some(id);
            }
        }
        None
    }
}

/// Dispatcher counters, logged on exit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Datagrams received
    pub received: u64,
    /// Datagrams claimed by a handler
    pub claimed: u64,
    /// Datagrams no handler wanted
    pub unclaimed: u64,
    /// Failed receive calls
    pub errors: u64,
}

/// Handle to the running dispatcher task
pub(crate) struct ReceiveDispatcher {
    running: Arc<AtomicBool>,
    handle: JoinHandle<DispatchStats>,
}

impl ReceiveDispatcher {
    pub(crate) fn spawn(
        transport: Arc<dyn MeshTransport>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(run_dispatcher(transport, handlers, running.clone()));
        info!("Receive dispatcher started");
        Self { running, handle }
    }

    /// Clear the run flag and wait up to `timeout` for the loop to exit
    pub(crate) async fn shutdown(self, timeout: Duration) -> Result<DispatchStats, MeshError> {
        self.running.store(false, Ordering::SeqCst);

        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(e)) => {
                error!("Receive dispatcher task failed: {}", e);
                Ok(DispatchStats::default())
            }
            Err(_) => {
                handle.abort();
                Err(MeshError::ShutdownTimeout {
                    task: "receive dispatcher",
                    timeout,
                })
            }
        }
    }
}

async fn run_dispatcher(
    transport: Arc<dyn MeshTransport>,
    handlers: Arc<HandlerRegistry>,
    running: Arc<AtomicBool>,
) -> DispatchStats {
    let mut stats = DispatchStats::default();

    while running.load(Ordering::SeqCst) {
        match transport.recv(RECV_TIMEOUT).await {
            Ok(Some(datagram)) => {
                stats.received += 1;
                if handlers.dispatch(&datagram).is_some() {
                    stats.claimed += 1;
                } else {
                    stats.unclaimed += 1;
                    debug!(
                        "No handler for datagram from {} ({} bytes)",
                        datagram.from,
                        datagram.data.len()
                    );
                }
            }
            Ok(None) => {}
            Err(TransportError::Closed) => {
                warn!("Transport closed, receive dispatcher exiting");
                break;
            }
            Err(e) => {
                stats.errors += 1;
                warn!("Mesh receive failed: {}", e);
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }

    info!(
        "Receive dispatcher stopped: {} received, {} claimed, {} unclaimed, {} errors",
        stats.received, stats.claimed, stats.unclaimed, stats.errors
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mesh_routing::HwAddr;
    use std::sync::Mutex;

    struct PrefixHandler {
        name: String,
        prefix: &'static [u8],
        seen: Mutex<Vec<Bytes>>,
    }

    impl PrefixHandler {
        fn new(name: &str, prefix: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                prefix,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl DatagramHandler for PrefixHandler {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle_datagram(&self, datagram: &Datagram) -> Dispatch {
            self.seen.lock().unwrap().push(datagram.data.clone());
            if datagram.data.starts_with(self.prefix) {
                Dispatch::Claimed
            } else {
                Dispatch::NotMine
            }
        }
    }

    fn datagram(data: &'static [u8]) -> Datagram {
        Datagram {
            from: HwAddr([0, 0, 0, 0, 0, 1]),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_priority_order() {
        let registry = HandlerRegistry::new();
        let bridge = PrefixHandler::new("bridge", b"OEG");
        let chat = PrefixHandler::new("chat", b"CHAT");

        let bridge_id = registry.register(PRIORITY_BRIDGE, bridge.clone());
        let chat_id = registry.register(PRIORITY_PROTOCOL, chat.clone());
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.dispatch(&datagram(b"CHAT:hi")), Some(chat_id));
        assert_eq!(chat.seen(), 1);
        assert_eq!(bridge.seen(), 0);

        assert_eq!(registry.dispatch(&datagram(b"OEG\0rest")), Some(bridge_id));
        assert_eq!(chat.seen(), 2);
        assert_eq!(bridge.seen(), 1);

        assert_eq!(registry.dispatch(&datagram(b"noise")), None);
        assert_eq!(bridge.seen(), 2);
    }

    #[test]
    fn test_unregister() {
        let registry = HandlerRegistry::new();
        let chat = PrefixHandler::new("chat", b"CHAT");
        let id = registry.register(PRIORITY_PROTOCOL, chat.clone());

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
        assert_eq!(registry.dispatch(&datagram(b"CHAT:hi")), None);
        assert_eq!(chat.seen(), 0);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let registry = HandlerRegistry::new();
        let first = PrefixHandler::new("first", b"X");
        let second = PrefixHandler::new("second", b"X");

        let first_id = registry.register(PRIORITY_PROTOCOL, first);
        registry.register(PRIORITY_PROTOCOL, second.clone());

        assert_eq!(registry.dispatch(&datagram(b"X1")), Some(first_id));
        assert_eq!(second.seen(), 0);
    }
}
