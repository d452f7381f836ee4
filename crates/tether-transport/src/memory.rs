//! In-process network for tests and simulation.
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryTransport`]s by address.
//! Nodes are attached either [`NatKind::Open`] (accept requests from anyone)
//! or [`NatKind::Restricted`], which emulates an address-restricted NAT: an
//! inbound request is accepted only if the restricted node has previously sent
//! a request to the requester's address. Requests dropped by a NAT are
//! reported as [`TransportError::Timeout`] immediately instead of after the
//! full timeout, which keeps simulations fast. A node can be given a latency
//! that delays every request it receives.

use crate::transport::{RequestHandler, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Inbound reachability of a simulated node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    /// Publicly reachable
    Open,
    /// Behind an address-restricted NAT
    Restricted,
}

struct Node {
    nat: NatKind,
    online: bool,
    handler: Option<Weak<dyn RequestHandler>>,
    /// Delay before an inbound request reaches the handler
    latency: Duration,
    /// Addresses this node has sent to
    mappings: HashSet<SocketAddr>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<SocketAddr, Node>,
    next_host: u32,
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

enum Route {
    Deliver(Arc<dyn RequestHandler>, Duration),
    Refused,
    Dropped,
    Offline,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh address not used by any attached node.
    #[must_use]
    pub fn allocate_addr(&self) -> SocketAddr {
        let mut state = self.lock();
        loop {
            state.next_host = state.next_host.wrapping_add(1);
            let host = state.next_host;
            let ip = Ipv4Addr::from(0x0A00_0000 | (host & 0x00FF_FFFF));
            let addr = SocketAddr::new(IpAddr::V4(ip), 4000);
            if !state.nodes.contains_key(&addr) {
                return addr;
            }
        }
    }

    /// Attach a node at `addr`, replacing any previous node at that address.
    #[must_use]
    pub fn attach(&self, addr: SocketAddr, nat: NatKind) -> MemoryTransport {
        self.lock().nodes.insert(
            addr,
            Node {
                nat,
                online: true,
                handler: None,
                latency: Duration::ZERO,
                mappings: HashSet::new(),
            },
        );
        tracing::trace!("Attached {:?} node at {}", nat, addr);

        MemoryTransport {
            network: self.clone(),
            addr,
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Attach a node at a freshly allocated address.
    #[must_use]
    pub fn attach_new(&self, nat: NatKind) -> MemoryTransport {
        let addr = self.allocate_addr();
        self.attach(addr, nat)
    }

    /// Take a node offline or bring it back. Offline nodes refuse every
    /// inbound request and cannot send.
    pub fn set_online(&self, addr: SocketAddr, online: bool) {
        if let Some(node) = self.lock().nodes.get_mut(&addr) {
            node.online = online;
            tracing::trace!("Node {} online={}", addr, online);
        }
    }

    /// Change the NAT behaviour of a node.
    pub fn set_nat(&self, addr: SocketAddr, nat: NatKind) {
        if let Some(node) = self.lock().nodes.get_mut(&addr) {
            node.nat = nat;
        }
    }

    /// Delay every request `addr` receives by `latency`.
    pub fn set_latency(&self, addr: SocketAddr, latency: Duration) {
        if let Some(node) = self.lock().nodes.get_mut(&addr) {
            node.latency = latency;
        }
    }

    /// Whether a node is attached at `addr` and online.
    #[must_use]
    pub fn is_online(&self, addr: &SocketAddr) -> bool {
        self.lock().nodes.get(addr).is_some_and(|node| node.online)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        // A panic while holding the lock leaves only plain data behind
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn route(&self, from: SocketAddr, to: SocketAddr) -> Route {
        let mut state = self.lock();

        match state.nodes.get_mut(&from) {
            Some(sender) if sender.online => {
                sender.mappings.insert(to);
            }
            _ => return Route::Offline,
        }

        let Some(target) = state.nodes.get(&to) else {
            return Route::Refused;
        };
        if !target.online {
            return Route::Refused;
        }
        if target.nat == NatKind::Restricted && !target.mappings.contains(&from) {
            return Route::Dropped;
        }
        match target.handler.as_ref().and_then(Weak::upgrade) {
            Some(handler) => Route::Deliver(handler, target.latency),
            None => Route::Refused,
        }
    }

    fn install(&self, addr: SocketAddr, handler: Weak<dyn RequestHandler>) {
        if let Some(node) = self.lock().nodes.get_mut(&addr) {
            node.handler = Some(handler);
        }
    }

    fn detach(&self, addr: SocketAddr) {
        self.lock().nodes.remove(&addr);
    }
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    requests_sent: AtomicU64,
    requests_served: AtomicU64,
    request_failures: AtomicU64,
}

/// Transport endpoint attached to a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: SocketAddr,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl MemoryTransport {
    /// The network this transport is attached to.
    #[must_use]
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn fail(&self, error: TransportError) -> TransportResult<Vec<u8>> {
        self.counters.request_failures.fetch_add(1, Ordering::Relaxed);
        Err(error)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_request(
        &self,
        addr: SocketAddr,
        request: Vec<u8>,
        timeout: Duration,
    ) -> TransportResult<Vec<u8>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.counters.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(request.len() as u64, Ordering::Relaxed);

        let (handler, latency) = match self.network.route(self.addr, addr) {
            Route::Deliver(handler, latency) => (handler, latency),
            Route::Refused => return self.fail(TransportError::ConnectionRefused(addr)),
            Route::Dropped => {
                tracing::trace!("NAT at {} dropped request from {}", addr, self.addr);
                return self.fail(TransportError::Timeout(addr));
            }
            Route::Offline => {
                return self.fail(TransportError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "sending node is offline",
                )));
            }
        };

        // The handler keeps running if the requester gives up
        let from = self.addr;
        let task = tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            handler.handle(from, request).await
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Some(response))) => {
                self.counters
                    .bytes_received
                    .fetch_add(response.len() as u64, Ordering::Relaxed);
                Ok(response)
            }
            Ok(Ok(None)) => self.fail(TransportError::NoResponse(addr)),
            Ok(Err(join_error)) => {
                tracing::warn!("Handler at {} failed: {}", addr, join_error);
                self.fail(TransportError::NoResponse(addr))
            }
            Err(_) => self.fail(TransportError::Timeout(addr)),
        }
    }

    fn serve(&self, handler: Weak<dyn RequestHandler>) {
        self.network.install(self.addr, handler);
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.addr)
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.network.detach(self.addr);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            requests_sent: self.counters.requests_sent.load(Ordering::Relaxed),
            requests_served: self.counters.requests_served.load(Ordering::Relaxed),
            request_failures: self.counters.request_failures.load(Ordering::Relaxed),
        }
    }
}
