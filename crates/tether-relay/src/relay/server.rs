//! Relay server for forwarding messages to registered unreachable peers.

use super::{Queued, batch_wait, enqueue_and_wait, resolve_batch, round_trip, split_batch};
use crate::buffer::{BatchSink, BufferPipe};
use crate::config::RelayServerConfig;
use crate::error::{RelayError, RelayResult};
use crate::message::{Body, Envelope, ErrorCode, Outbound};
use crate::peer::{PeerAddress, PeerId, PublishedAddress};
use crate::strategy::{RelayKind, RelayStrategy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_transport::Transport;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Neighbors returned for a lookup answered on a registrant's behalf
const NEIGHBOR_REPLY_SIZE: usize = 20;

type RegistrantPipe = Arc<BufferPipe<Queued<Envelope>>>;

/// One registered unreachable peer
struct Registration {
    /// Registrant's address record, refreshed on every request it makes
    address: PeerAddress,
    /// Where the registrant's requests come from
    endpoint: SocketAddr,
    /// Last request or successful delivery
    last_seen: Instant,
    /// Mirrored verified neighbors of the registrant
    neighbors: Vec<PeerAddress>,
    /// Inbound buffer for buffered relaying
    pipe: Option<RegistrantPipe>,
}

impl Registration {
    fn refresh(&mut self, address: PeerAddress, endpoint: SocketAddr) {
        self.address = address;
        self.endpoint = endpoint;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() < timeout
    }
}

struct ServerInner {
    config: RelayServerConfig,
    transport: Arc<dyn Transport>,
    local: PublishedAddress,
    local_addr: SocketAddr,
    registrations: RwLock<HashMap<PeerId, Registration>>,
}

/// Relay server
pub struct RelayServer {
    inner: Arc<ServerInner>,
    cleanup: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
    /// Create a relay server sending through `transport` as `local`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidConfig` if the configuration does not
    /// validate, or a transport error if the local address is unknown.
    pub fn new(
        config: RelayServerConfig,
        transport: Arc<dyn Transport>,
        local: PublishedAddress,
    ) -> RelayResult<Self> {
        config.validate()?;
        let local_addr = transport.local_addr()?;

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                transport,
                local,
                local_addr,
                registrations: RwLock::new(HashMap::new()),
            }),
            cleanup: std::sync::Mutex::new(None),
        })
    }

    /// Spawn the task removing idle registrations every cleanup interval.
    pub fn start_cleanup(&self) {
        let server = Arc::downgrade(&self.inner);
        let period = self.inner.config.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                server.remove_expired().await;
            }
        });

        if let Some(previous) = self.cleanup_handle().replace(handle) {
            previous.abort();
        }
    }

    /// Accept or refresh a registration from `peer`, whose requests arrive
    /// from `from`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Rejected` with `UnsupportedKind` if `kind` is not
    /// the kind this server relays, and `RelayError::CapacityExceeded` if a
    /// new registration would exceed `max_clients`.
    pub async fn register(
        &self,
        from: SocketAddr,
        peer: PeerAddress,
        kind: RelayKind,
    ) -> RelayResult<()> {
        self.inner.register(from, peer, kind).await
    }

    /// Remove a registration, delivering whatever is still buffered first.
    /// Returns whether the peer was registered.
    pub async fn deregister(&self, peer: &PeerId) -> bool {
        self.inner.deregister(peer).await
    }

    /// Forward `envelope` to the registered peer `destination` and return its
    /// answer.
    ///
    /// A neighbor query is answered from the mirrored neighbor snapshot on
    /// the registrant's behalf.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotRegistered` if `destination` has no
    /// registration, and a delivery error if the registrant did not answer.
    pub async fn forward(&self, destination: PeerId, envelope: &Envelope) -> RelayResult<Envelope> {
        self.inner.forward(destination, envelope).await
    }

    /// Send a registrant's outbound messages in order and collect the
    /// answers, one slot per message.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotRegistered` if `sender` has no registration.
    pub async fn relay_outbound(
        &self,
        from: SocketAddr,
        sender: PeerAddress,
        messages: Vec<Outbound>,
    ) -> RelayResult<Vec<Option<Envelope>>> {
        self.inner.relay_outbound(from, sender, messages).await
    }

    /// Answer one relay-protocol request.
    pub async fn handle(&self, from: SocketAddr, envelope: Envelope) -> Envelope {
        self.inner.handle(from, envelope).await
    }

    /// Forward an envelope addressed to another peer, turning failures into
    /// error replies.
    pub async fn forward_envelope(&self, envelope: Envelope) -> Envelope {
        let local = self.inner.local.current().as_ref().clone();
        let Some(destination) = envelope.recipient else {
            return envelope.error(local, ErrorCode::InvalidMessage, "missing recipient");
        };

        match self.inner.forward(destination, &envelope).await {
            Ok(reply) => reply,
            Err(e) => envelope.error(local, error_code(&e), e.to_string()),
        }
    }

    /// Remove registrations idle longer than the client timeout. Returns how
    /// many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        self.inner.remove_expired().await
    }

    /// Stop the cleanup task, deliver what is still buffered and drop every
    /// registration.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.cleanup_handle().take() {
            handle.abort();
        }

        let pipes: Vec<RegistrantPipe> = self
            .inner
            .registrations
            .read()
            .await
            .values()
            .filter_map(|registration| registration.pipe.clone())
            .collect();
        // Flushes need the registrant endpoints, so close before removing
        for pipe in pipes {
            pipe.close().await;
        }

        self.inner.registrations.write().await.clear();
        tracing::debug!("Relay server at {} shut down", self.inner.local_addr);
    }

    /// Get number of registered peers
    pub async fn client_count(&self) -> usize {
        self.inner.registrations.read().await.len()
    }

    /// Whether `peer` is registered
    pub async fn is_registered(&self, peer: &PeerId) -> bool {
        self.inner.is_registered(peer).await
    }

    /// Identities of all registered peers
    pub async fn registered_peers(&self) -> Vec<PeerId> {
        self.inner.registrations.read().await.keys().copied().collect()
    }

    /// Mirrored neighbors of `peer`
    pub async fn mirrored_neighbors(&self, peer: &PeerId) -> Option<Vec<PeerAddress>> {
        self.inner
            .registrations
            .read()
            .await
            .get(peer)
            .map(|registration| registration.neighbors.clone())
    }

    /// Relay strategy served
    #[must_use]
    pub fn strategy(&self) -> RelayStrategy {
        self.inner.config.strategy
    }

    /// Server configuration
    #[must_use]
    pub fn config(&self) -> &RelayServerConfig {
        &self.inner.config
    }

    fn cleanup_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.cleanup
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle().take() {
            handle.abort();
        }
    }
}

impl ServerInner {
    fn local_record(&self) -> PeerAddress {
        self.local.current().as_ref().clone()
    }

    async fn register(
        self: &Arc<Self>,
        from: SocketAddr,
        peer: PeerAddress,
        kind: RelayKind,
    ) -> RelayResult<()> {
        let served = self.config.strategy.kind();
        if kind != served {
            tracing::debug!("Rejected {} registration from {}: serving {}", kind, peer, served);
            return Err(RelayError::Rejected {
                code: ErrorCode::UnsupportedKind,
                message: format!("relay serves {served} connections"),
            });
        }

        let id = peer.id();
        let mut registrations = self.registrations.write().await;
        if let Some(existing) = registrations.get_mut(&id) {
            existing.refresh(peer, from);
            tracing::debug!("Refreshed registration of {}", id);
            return Ok(());
        }

        if registrations.len() >= self.config.max_clients {
            tracing::debug!("Rejected registration from {}: server at capacity", peer);
            return Err(RelayError::CapacityExceeded(self.local_addr));
        }

        let pipe = match self.config.strategy {
            RelayStrategy::Unbuffered => None,
            RelayStrategy::Buffered(limits) => {
                let sink = Arc::new(RegistrantSink {
                    server: Arc::downgrade(self),
                    peer: id,
                });
                Some(Arc::new(BufferPipe::new(
                    limits,
                    sink,
                    format!("relay server for {}", id.short()),
                )))
            }
        };

        tracing::info!("Registered {} from {}", peer, from);
        registrations.insert(
            id,
            Registration {
                address: peer,
                endpoint: from,
                last_seen: Instant::now(),
                neighbors: Vec::new(),
                pipe,
            },
        );
        Ok(())
    }

    async fn deregister(&self, peer: &PeerId) -> bool {
        let pipe = match self.registrations.read().await.get(peer) {
            Some(registration) => registration.pipe.clone(),
            None => return false,
        };
        if let Some(pipe) = pipe {
            pipe.close().await;
        }

        let removed = self.registrations.write().await.remove(peer).is_some();
        if removed {
            tracing::info!("Deregistered {}", peer);
        }
        removed
    }

    /// Refresh a registration on a request from the registrant.
    async fn touch(&self, sender: &PeerAddress, from: SocketAddr) -> bool {
        match self.registrations.write().await.get_mut(&sender.id()) {
            Some(registration) => {
                registration.refresh(sender.clone(), from);
                true
            }
            None => false,
        }
    }

    async fn update_neighbors(
        &self,
        sender: &PeerAddress,
        from: SocketAddr,
        neighbors: Vec<PeerAddress>,
    ) -> RelayResult<()> {
        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .get_mut(&sender.id())
            .ok_or(RelayError::NotRegistered(sender.id()))?;

        registration.refresh(sender.clone(), from);
        tracing::trace!("Mirrored {} neighbors of {}", neighbors.len(), sender.id());
        registration.neighbors = neighbors;
        Ok(())
    }

    async fn is_registered(&self, peer: &PeerId) -> bool {
        self.registrations.read().await.contains_key(peer)
    }

    async fn endpoint_of(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.registrations
            .read()
            .await
            .get(peer)
            .map(|registration| registration.endpoint)
    }

    async fn forward(&self, destination: PeerId, envelope: &Envelope) -> RelayResult<Envelope> {
        let (endpoint, pipe) = {
            let registrations = self.registrations.read().await;
            let registration = registrations
                .get(&destination)
                .ok_or(RelayError::NotRegistered(destination))?;

            if let Body::NeighborQuery { target } = &envelope.body {
                let mut neighbors = registration.neighbors.clone();
                neighbors.sort_by(|a, b| target.cmp_distance(&a.id(), &b.id()));
                neighbors.truncate(NEIGHBOR_REPLY_SIZE);
                tracing::trace!("Answered neighbor query for {} from mirror", destination);
                return Ok(envelope.reply(
                    registration.address.clone(),
                    Body::NeighborReply { neighbors },
                ));
            }

            (registration.endpoint, registration.pipe.clone())
        };

        let result = match pipe {
            None => {
                round_trip(
                    self.transport.as_ref(),
                    endpoint,
                    envelope,
                    self.config.forward_timeout,
                )
                .await
            }
            Some(pipe) => {
                let wait = batch_wait(self.config.strategy.limits(), self.config.forward_timeout)
                    .min(self.config.client_timeout.saturating_add(self.config.forward_timeout));
                match enqueue_and_wait(&pipe, envelope.clone(), wait).await {
                    Ok(Some(reply)) => Ok(reply),
                    Ok(None) => Err(RelayError::ConnectionFailed(
                        "registrant did not answer".to_string(),
                    )),
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(reply) => {
                if let Some(registration) = self.registrations.write().await.get_mut(&destination) {
                    registration.touch();
                }
                tracing::trace!("Forwarded {} to {}", envelope.body.name(), destination);
                Ok(reply)
            }
            Err(e) => {
                tracing::debug!("Forwarding to {} failed: {}", destination, e);
                Err(e)
            }
        }
    }

    async fn relay_outbound(
        &self,
        from: SocketAddr,
        sender: PeerAddress,
        messages: Vec<Outbound>,
    ) -> RelayResult<Vec<Option<Envelope>>> {
        if !self.touch(&sender, from).await {
            return Err(RelayError::NotRegistered(sender.id()));
        }

        let mut replies = Vec::with_capacity(messages.len());
        for Outbound {
            destination,
            envelope,
        } in messages
        {
            let registrant = match envelope.recipient {
                Some(id) => self.is_registered(&id).await.then_some(id),
                None => None,
            };

            let reply = match registrant {
                Some(id) => self.forward(id, &envelope).await,
                None => {
                    round_trip(
                        self.transport.as_ref(),
                        destination.udp_addr(),
                        &envelope,
                        self.config.forward_timeout,
                    )
                    .await
                }
            };

            match reply {
                Ok(reply) => replies.push(Some(reply)),
                Err(e) => {
                    tracing::debug!("Outbound message from {} to {} failed: {}", sender.id(), destination, e);
                    replies.push(None);
                }
            }
        }
        Ok(replies)
    }

    async fn handle(self: &Arc<Self>, from: SocketAddr, mut envelope: Envelope) -> Envelope {
        let local = self.local_record();
        let sender = envelope.sender.clone();

        let result = match std::mem::replace(&mut envelope.body, Body::Ack) {
            Body::Register { kind } => self
                .register(from, sender, kind)
                .await
                .map(|()| Body::RegisterAck { relay_id: local.id() }),
            Body::Deregister => {
                self.deregister(&sender.id()).await;
                Ok(Body::Ack)
            }
            Body::KeepAlive => {
                if self.touch(&sender, from).await {
                    Ok(Body::Ack)
                } else {
                    Err(RelayError::NotRegistered(sender.id()))
                }
            }
            Body::PeerMapUpdate { neighbors } => self
                .update_neighbors(&sender, from, neighbors)
                .await
                .map(|()| Body::Ack),
            Body::Relay { messages } => self
                .relay_outbound(from, sender, messages)
                .await
                .map(|replies| Body::BatchReply { replies }),
            other => {
                return envelope.error(
                    local,
                    ErrorCode::InvalidMessage,
                    format!("{} is not a relay request", other.name()),
                );
            }
        };

        match result {
            Ok(body) => envelope.reply(local, body),
            Err(RelayError::NotRegistered(id)) => {
                envelope.error(local, ErrorCode::NotRegistered, format!("{id} is not registered"))
            }
            Err(e) => envelope.error(local, error_code(&e), e.to_string()),
        }
    }

    async fn remove_expired(&self) -> usize {
        let timeout = self.config.client_timeout;
        let expired: Vec<(PeerId, Option<RegistrantPipe>)> = self
            .registrations
            .read()
            .await
            .iter()
            .filter(|(_, registration)| !registration.is_alive(timeout))
            .map(|(id, registration)| (*id, registration.pipe.clone()))
            .collect();

        let mut removed = 0;
        for (id, pipe) in expired {
            if let Some(pipe) = pipe {
                pipe.close().await;
            }
            if self.registrations.write().await.remove(&id).is_some() {
                tracing::info!("Registration of {} expired", id);
                removed += 1;
            }
        }
        removed
    }
}

/// Error code reported to the requester for a server-side failure
fn error_code(error: &RelayError) -> ErrorCode {
    match error {
        RelayError::CapacityExceeded(_) => ErrorCode::ServerFull,
        RelayError::Rejected { code, .. } => *code,
        RelayError::NotRegistered(_) => ErrorCode::PeerNotFound,
        _ => ErrorCode::DeliveryFailed,
    }
}

/// Delivers drained inbound batches to a registrant as one `Batch` request
struct RegistrantSink {
    server: Weak<ServerInner>,
    peer: PeerId,
}

#[async_trait]
impl BatchSink<Queued<Envelope>> for RegistrantSink {
    async fn deliver(&self, batch: Vec<Queued<Envelope>>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let Some(endpoint) = server.endpoint_of(&self.peer).await else {
            tracing::debug!("Dropping batch for {}: no longer registered", self.peer);
            return;
        };

        let (envelopes, slots) = split_batch(batch);
        if envelopes.is_empty() {
            return;
        }
        let count = envelopes.len();
        let request = Envelope::new(server.local_record(), Some(self.peer), Body::Batch { envelopes });

        match round_trip(
            server.transport.as_ref(),
            endpoint,
            &request,
            server.config.forward_timeout,
        )
        .await
        {
            Ok(reply) if reply.sender.id() == self.peer => {
                if resolve_batch(slots, &reply) {
                    tracing::trace!("Delivered batch of {} to {}", count, self.peer);
                } else {
                    tracing::warn!("Malformed batch reply from {}", self.peer);
                }
            }
            Ok(reply) => {
                tracing::warn!(
                    "Batch for {} answered by {}",
                    self.peer,
                    reply.sender.id()
                );
            }
            Err(e) => {
                tracing::debug!("Batch of {} to {} failed: {}", count, self.peer, e);
            }
        }
    }
}
