//! Peer node.
//!
//! A [`Peer`] binds one transport to a neighbor table, an optional relay
//! server, an optional relay manager and the dispatcher. It routes inbound
//! envelopes and runs the maintenance tick every peer needs: overflow
//! promotion everywhere, plus relay reconciliation, peer-map push and
//! address announcement on an unreachable peer.

use crate::config::{PeerConfig, RelayClientConfig};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{DispatchError, RelayError, RelayResult};
use crate::manager::{RelayManager, RelayOutcome};
use crate::message::{Body, Envelope, ErrorCode};
use crate::neighbor::{NeighborTable, PeerMap};
use crate::peer::{PeerAddress, PeerId, PublishedAddress};
use crate::relay::{RelayServer, round_trip};
use crate::replay::ReplayCache;
use crate::strategy::RelayStrategy;
use crate::sync::PeerMapSynchronizer;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_transport::{RequestHandler, Transport};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Application handler for [`Body::Data`] requests
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Answer `payload` sent by `sender`.
    async fn handle(&self, sender: &PeerAddress, payload: Vec<u8>) -> Vec<u8>;
}

/// Peer inner state
pub(crate) struct PeerInner {
    config: PeerConfig,
    published: PublishedAddress,
    transport: Arc<dyn Transport>,
    neighbors: Arc<PeerMap>,
    sync: Arc<PeerMapSynchronizer>,
    dispatcher: Dispatcher,
    server: Option<RelayServer>,
    manager: RwLock<Option<Arc<RelayManager>>>,
    handler: Option<Arc<dyn MessageHandler>>,
    answered: ReplayCache,
    running: AtomicBool,
    maintenance: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Overlay peer
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl Peer {
    /// Start a peer on `transport`: install the request handler, start the
    /// relay server's cleanup if one is configured and spawn the maintenance
    /// loop. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidConfig` if the configuration does not
    /// validate, or a transport error if the local address is unknown.
    pub fn start(
        config: PeerConfig,
        transport: Arc<dyn Transport>,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> RelayResult<Self> {
        config.validate()?;

        let id = config.id.unwrap_or_else(PeerId::random);
        let local_addr = transport.local_addr()?;
        let address = PeerAddress::new(id, local_addr)
            .with_firewalled(config.firewalled_tcp, config.firewalled_udp);
        let published = PublishedAddress::new(address);

        let neighbors = Arc::new(PeerMap::with_capacity(id, config.overflow_capacity));
        let table: Arc<dyn NeighborTable> = neighbors.clone();
        let sync = Arc::new(PeerMapSynchronizer::new(
            published.clone(),
            transport.clone(),
            table,
            config.request_timeout,
        ));
        let dispatcher = Dispatcher::new(
            transport.clone(),
            published.clone(),
            config.request_timeout,
            config.relay_timeout,
        );
        let server = config
            .relay_server
            .clone()
            .map(|server| RelayServer::new(server, transport.clone(), published.clone()))
            .transpose()?;

        let inner = Arc::new(PeerInner {
            config,
            published,
            transport,
            neighbors,
            sync,
            dispatcher,
            server,
            manager: RwLock::new(None),
            handler,
            answered: ReplayCache::default(),
            running: AtomicBool::new(true),
            maintenance: std::sync::Mutex::new(None),
        });

        let request_handler: Arc<dyn RequestHandler> = inner.clone();
        inner.transport.serve(Arc::downgrade(&request_handler));
        if let Some(server) = &inner.server {
            server.start_cleanup();
        }
        let handle = spawn_maintenance(
            Arc::downgrade(&inner),
            inner.config.peer_map_update_interval,
        );
        *inner.maintenance_handle() = Some(handle);

        tracing::info!(
            "Started peer {} on {}{}",
            id,
            local_addr,
            if inner.server.is_some() { " (relay)" } else { "" }
        );
        Ok(Self { inner })
    }

    /// Stop the maintenance loop, tear relays down, stop serving as a relay
    /// and close the transport.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.maintenance_handle().take() {
            handle.abort();
        }

        if let Some(manager) = self.inner.manager.write().await.take() {
            manager.shutdown().await;
        }
        if let Some(server) = &self.inner.server {
            server.shutdown().await;
        }
        if let Err(e) = self.inner.transport.close().await {
            tracing::warn!("Error closing transport: {}", e);
        }
        tracing::info!("Peer {} stopped", self.id());
    }

    /// Check if the peer is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl Peer {
    /// Local peer id
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.inner.published.current().id()
    }

    /// Currently published address
    #[must_use]
    pub fn address(&self) -> Arc<PeerAddress> {
        self.inner.published.current()
    }

    /// Handle on the published address, for subscribing to changes
    #[must_use]
    pub fn published(&self) -> &PublishedAddress {
        &self.inner.published
    }

    /// Address the transport is bound to
    ///
    /// # Errors
    /// Returns a transport error if the address cannot be determined.
    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.inner.transport.local_addr()?)
    }

    /// Neighbor table
    #[must_use]
    pub fn neighbors(&self) -> &Arc<PeerMap> {
        &self.inner.neighbors
    }

    /// Relay server, if this peer relays for others
    #[must_use]
    pub fn relay_server(&self) -> Option<&RelayServer> {
        self.inner.server.as_ref()
    }

    /// Relay manager, once [`start_relay`](Self::start_relay) has run
    pub async fn relay_manager(&self) -> Option<Arc<RelayManager>> {
        self.inner.manager.read().await.clone()
    }

    /// Peer configuration
    #[must_use]
    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Overlay Operations
// ═══════════════════════════════════════════════════════════════════════════

impl Peer {
    /// Learn neighbors from the peer at `addr`.
    ///
    /// # Errors
    /// Returns a transport or codec error if the query fails.
    pub async fn bootstrap(&self, addr: SocketAddr) -> RelayResult<usize> {
        self.inner.sync.bootstrap(addr).await
    }

    /// Ping whoever listens at `addr` and record its address.
    ///
    /// # Errors
    /// Returns a transport or codec error if the ping fails and
    /// `RelayError::UnexpectedReply` if the answer is not a pong.
    pub async fn ping(&self, addr: SocketAddr) -> RelayResult<PeerAddress> {
        let request = Envelope::new(self.address().as_ref().clone(), None, Body::Ping);
        let reply = round_trip(
            self.inner.transport.as_ref(),
            addr,
            &request,
            self.inner.config.request_timeout,
        )
        .await?;

        if reply.body != Body::Pong {
            return Err(RelayError::UnexpectedReply(reply.body.name()));
        }
        self.inner.neighbors.insert(reply.sender.clone());
        Ok(reply.sender)
    }

    /// Send `body` to `destination`, directly or through its relays.
    ///
    /// # Errors
    /// Returns `DispatchError::Unreachable` if no path worked.
    pub async fn send_message(
        &self,
        destination: &PeerAddress,
        body: Body,
    ) -> Result<DispatchOutcome, DispatchError> {
        let outcome = self.inner.dispatcher.send_message(destination, body).await?;
        self.inner.neighbors.insert(outcome.reply.sender.clone());
        Ok(outcome)
    }

    /// Send `body` to `destination` through this peer's own relays.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::RelayUnavailable` if relaying has not started or
    /// no relay delivered, `RelayError::ConnectionFailed` if the destination
    /// has no endpoint, and `RelayError::IdentityMismatch` if the answer came
    /// from another peer.
    pub async fn send_via_relay(
        &self,
        destination: &PeerAddress,
        body: Body,
    ) -> RelayResult<Envelope> {
        let manager = self
            .relay_manager()
            .await
            .ok_or(RelayError::RelayUnavailable)?;
        let endpoint = destination.primary_endpoint().ok_or_else(|| {
            RelayError::ConnectionFailed(format!("{} has no endpoint", destination.id()))
        })?;

        let envelope = Envelope::new(self.address().as_ref().clone(), Some(destination.id()), body);
        let reply = manager.send_through_relay(endpoint, envelope).await?;
        if reply.sender.id() != destination.id() {
            return Err(RelayError::IdentityMismatch {
                expected: destination.id(),
                actual: reply.sender.id(),
            });
        }
        self.inner.neighbors.insert(reply.sender.clone());
        Ok(reply)
    }

    /// Acquire relays and publish them on the local address.
    ///
    /// A previous relay manager is shut down and replaced. With `bootstrap`
    /// set, that peer is asked for neighbors first so candidates exist.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidConfig` if this peer is directly reachable
    /// or the configuration does not validate, and
    /// `RelayError::RelayUnavailable` if no candidate accepted.
    pub async fn start_relay(
        &self,
        strategy: RelayStrategy,
        client_config: RelayClientConfig,
        bootstrap: Option<SocketAddr>,
    ) -> RelayResult<RelayOutcome> {
        if !self.inner.config.firewalled_tcp && !self.inner.config.firewalled_udp {
            return Err(RelayError::InvalidConfig(
                "a directly reachable peer does not need relays".to_string(),
            ));
        }
        if !self.is_running() {
            return Err(RelayError::Shutdown);
        }

        let manager = {
            let mut slot = self.inner.manager.write().await;
            if let Some(previous) = slot.take() {
                previous.shutdown().await;
            }
            let table: Arc<dyn NeighborTable> = self.inner.neighbors.clone();
            let manager = Arc::new(RelayManager::new(
                self.inner.published.clone(),
                self.inner.transport.clone(),
                table,
                self.inner.sync.clone(),
                strategy,
                client_config,
            )?);
            *slot = Some(manager.clone());
            manager
        };

        let outcome = manager.start_relay(bootstrap).await?;
        // Mirror the neighbor snapshot right away instead of on the next tick
        self.inner
            .sync
            .push_peer_map(&manager.active_clients())
            .await;
        Ok(outcome)
    }

    /// Run one maintenance tick now.
    pub async fn maintenance_tick(&self) {
        self.inner.maintenance_tick().await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inbound Routing
// ═══════════════════════════════════════════════════════════════════════════

impl PeerInner {
    fn local_record(&self) -> PeerAddress {
        self.published.current().as_ref().clone()
    }

    fn maintenance_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.maintenance
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn route(&self, from: SocketAddr, envelope: Envelope) -> Envelope {
        let local = self.published.current().id();
        if envelope.sender.id() != local {
            self.neighbors.insert(envelope.sender.clone());
        }

        if envelope.is_for_other(&local) {
            return match &self.server {
                Some(server) => server.forward_envelope(envelope).await,
                None => envelope.error(
                    self.local_record(),
                    ErrorCode::PeerNotFound,
                    "not relaying for that peer",
                ),
            };
        }

        let relay_protocol = matches!(
            envelope.body,
            Body::Register { .. }
                | Body::Deregister
                | Body::KeepAlive
                | Body::PeerMapUpdate { .. }
                | Body::Relay { .. }
        );
        if relay_protocol {
            return match &self.server {
                Some(server) => server.handle(from, envelope).await,
                None => envelope.error(
                    self.local_record(),
                    ErrorCode::InvalidMessage,
                    "not a relay",
                ),
            };
        }

        match &envelope.body {
            Body::Batch { envelopes } => {
                let mut replies = Vec::with_capacity(envelopes.len());
                for inner in envelopes {
                    if inner.sender.id() != local {
                        self.neighbors.insert(inner.sender.clone());
                    }
                    replies.push(Some(self.answer(inner).await));
                }
                tracing::trace!("Answered batch of {} from {}", replies.len(), from);
                envelope.reply(self.local_record(), Body::BatchReply { replies })
            }
            _ => self.answer(&envelope).await,
        }
    }

    /// Answer a request addressed to this peer.
    async fn answer(&self, request: &Envelope) -> Envelope {
        let local = self.local_record();
        match &request.body {
            Body::Ping => request.reply(local, Body::Pong),
            Body::NeighborQuery { target } => {
                let neighbors = self
                    .neighbors
                    .closest(target, self.config.neighbor_reply_size);
                request.reply(local, Body::NeighborReply { neighbors })
            }
            Body::Data { payload } => match &self.handler {
                Some(handler) => {
                    self.answered
                        .answer_once(request.sender.id(), request.id, move || async move {
                            let payload = handler.handle(&request.sender, payload.clone()).await;
                            request.reply(local, Body::DataReply { payload })
                        })
                        .await
                }
                None => request.error(local, ErrorCode::NoHandler, "no application handler"),
            },
            body => request.error(
                local,
                ErrorCode::InvalidMessage,
                format!("unexpected {}", body.name()),
            ),
        }
    }

    async fn maintenance_tick(&self) {
        self.sync.promote_relayed();

        let Some(manager) = self.manager.read().await.clone() else {
            return;
        };
        match manager.reconcile().await {
            Ok(report) if report.changed() => {
                tracing::debug!("Reconciled relays: {} active", report.active);
            }
            Ok(_) => {}
            Err(RelayError::Shutdown) => return,
            Err(e) => tracing::warn!("Relay reconciliation failed: {}", e),
        }

        self.sync.push_peer_map(&manager.active_clients()).await;
        self.sync.announce().await;
    }
}

#[async_trait]
impl RequestHandler for PeerInner {
    async fn handle(&self, from: SocketAddr, request: Vec<u8>) -> Option<Vec<u8>> {
        let envelope = match Envelope::from_bytes(&request) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!("Dropping malformed request from {}: {}", from, e);
                return None;
            }
        };

        let reply = self.route(from, envelope).await;
        match reply.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Failed to encode reply to {}: {}", from, e);
                None
            }
        }
    }
}

fn spawn_maintenance(peer: Weak<PeerInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(inner) = peer.upgrade() else {
                break;
            };
            inner.maintenance_tick().await;
        }
    })
}
