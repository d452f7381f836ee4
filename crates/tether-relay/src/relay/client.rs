//! Relay client: the unreachable peer's end of one relay connection.

use super::{Queued, batch_wait, enqueue_and_wait, resolve_batch, round_trip, split_batch};
use crate::buffer::{BatchSink, BufferPipe};
use crate::config::RelayClientConfig;
use crate::error::{RelayError, RelayResult};
use crate::message::{Body, Envelope, Outbound};
use crate::peer::{PeerAddress, PeerId, PeerSocketAddress, PublishedAddress};
use crate::strategy::RelayStrategy;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_transport::Transport;

/// Lifecycle of a relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayConnectionState {
    /// Created, registration not yet confirmed
    Pending,
    /// Registered and usable
    Active,
    /// A round trip failed; the manager replaces the connection
    Failed,
    /// Torn down
    Closed,
}

type SharedState = Arc<Mutex<RelayConnectionState>>;

fn lock_state(state: &Mutex<RelayConnectionState>) -> std::sync::MutexGuard<'_, RelayConnectionState> {
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Move to `Failed` unless the connection was already closed.
fn mark_failed(state: &Mutex<RelayConnectionState>) {
    let mut state = lock_state(state);
    if *state != RelayConnectionState::Closed {
        *state = RelayConnectionState::Failed;
    }
}

/// Relay client for one relay server
pub struct RelayClient {
    /// Relay server record
    relay: PeerAddress,
    /// Relay endpoint advertised in the local address
    relay_socket: PeerSocketAddress,
    /// Local published address, sent as sender on every request
    local: PublishedAddress,
    transport: Arc<dyn Transport>,
    strategy: RelayStrategy,
    config: RelayClientConfig,
    state: SharedState,
    /// Outbound buffer, present for buffered connections once active
    pipe: Option<BufferPipe<Queued<Outbound>>>,
}

impl RelayClient {
    /// Create a client for the relay server `relay`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ConnectionFailed` if the relay record carries no
    /// endpoint.
    pub fn new(
        relay: PeerAddress,
        local: PublishedAddress,
        transport: Arc<dyn Transport>,
        strategy: RelayStrategy,
        config: RelayClientConfig,
    ) -> RelayResult<Self> {
        let relay_socket = relay.primary_endpoint().ok_or_else(|| {
            RelayError::ConnectionFailed(format!("relay {} has no endpoint", relay.id()))
        })?;

        Ok(Self {
            relay,
            relay_socket,
            local,
            transport,
            strategy,
            config,
            state: Arc::new(Mutex::new(RelayConnectionState::Pending)),
            pipe: None,
        })
    }

    /// Register with the relay server
    ///
    /// # Errors
    ///
    /// Returns `RelayError::CapacityExceeded` if the server is full,
    /// `RelayError::Rejected` if it does not serve this relay kind,
    /// `RelayError::IdentityMismatch` if another peer answered, or a
    /// transport error. Any failure leaves the connection `Failed`.
    pub async fn setup(&mut self) -> RelayResult<()> {
        if self.state() != RelayConnectionState::Pending {
            return Err(RelayError::NotActive);
        }

        let kind = self.strategy.kind();
        let result = match self
            .exchange(Body::Register { kind }, self.config.setup_timeout)
            .await
        {
            Ok(Body::RegisterAck { relay_id }) if relay_id == self.relay.id() => Ok(()),
            Ok(Body::RegisterAck { relay_id }) => Err(RelayError::IdentityMismatch {
                expected: self.relay.id(),
                actual: relay_id,
            }),
            Ok(other) => Err(RelayError::UnexpectedReply(other.name())),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            tracing::debug!("Relay setup with {} failed: {}", self.relay, e);
            mark_failed(&self.state);
            return Err(e);
        }

        if let RelayStrategy::Buffered(limits) = self.strategy {
            let sink = Arc::new(RelaySink {
                transport: self.transport.clone(),
                relay_addr: self.relay_addr(),
                relay_id: self.relay.id(),
                local: self.local.clone(),
                timeout: self.config.request_timeout,
                state: self.state.clone(),
            });
            self.pipe = Some(BufferPipe::new(
                limits,
                sink,
                format!("relay client {}", self.relay.id().short()),
            ));
        }

        *lock_state(&self.state) = RelayConnectionState::Active;
        tracing::info!("Registered with {} relay {}", kind, self.relay);
        Ok(())
    }

    /// Send `envelope` to `destination` through the relay and return the
    /// destination's answer, if any.
    ///
    /// Buffered connections hold the message until its batch drains.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotActive` if the connection is not active and
    /// `RelayError::ConnectionFailed` if the relay round trip fails.
    pub async fn send(
        &self,
        destination: PeerSocketAddress,
        envelope: Envelope,
    ) -> RelayResult<Option<Envelope>> {
        self.ensure_active()?;
        let message = Outbound {
            destination,
            envelope,
        };

        if let Some(pipe) = &self.pipe {
            let wait = batch_wait(self.strategy.limits(), self.config.request_timeout);
            return enqueue_and_wait(pipe, message, wait).await;
        }

        let body = Body::Relay {
            messages: vec![message],
        };
        match self.exchange(body, self.config.request_timeout).await {
            Ok(Body::BatchReply { mut replies }) if replies.len() == 1 => {
                Ok(replies.pop().flatten())
            }
            Ok(other) => self.fail(RelayError::UnexpectedReply(other.name())),
            Err(e) => self.fail(e),
        }
    }

    /// Refresh the registration
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ConnectionFailed` if the relay does not
    /// acknowledge; the connection is then `Failed`.
    pub async fn keep_alive(&self) -> RelayResult<()> {
        self.ensure_active()?;
        self.expect_ack(Body::KeepAlive).await
    }

    /// Mirror the local verified neighbors on the relay
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ConnectionFailed` if the relay does not
    /// acknowledge; the connection is then `Failed`.
    pub async fn sync_peer_map(&self, neighbors: Vec<PeerAddress>) -> RelayResult<()> {
        self.ensure_active()?;
        self.expect_ack(Body::PeerMapUpdate { neighbors }).await
    }

    /// Flush pending messages and deregister. Best effort: the connection
    /// ends `Closed` whatever the relay answers.
    pub async fn teardown(&self) {
        if let Some(pipe) = &self.pipe {
            pipe.close().await;
        }

        if self.state() == RelayConnectionState::Active {
            if let Err(e) = self
                .exchange(Body::Deregister, self.config.request_timeout)
                .await
            {
                tracing::debug!("Deregister from {} failed: {}", self.relay, e);
            }
        }

        *lock_state(&self.state) = RelayConnectionState::Closed;
        tracing::debug!("Relay connection to {} closed", self.relay);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> RelayConnectionState {
        *lock_state(&self.state)
    }

    /// Whether the connection is usable
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == RelayConnectionState::Active
    }

    /// Relay server record
    #[must_use]
    pub fn relay(&self) -> &PeerAddress {
        &self.relay
    }

    /// Relay server identity
    #[must_use]
    pub fn relay_id(&self) -> PeerId {
        self.relay.id()
    }

    /// Relay endpoint to advertise
    #[must_use]
    pub fn relay_socket(&self) -> PeerSocketAddress {
        self.relay_socket
    }

    /// Datagram address of the relay server
    #[must_use]
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_socket.udp_addr()
    }

    /// Strategy of this connection
    #[must_use]
    pub fn strategy(&self) -> RelayStrategy {
        self.strategy
    }

    /// Messages waiting in the outbound buffer
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pipe.as_ref().map_or(0, BufferPipe::pending)
    }

    fn ensure_active(&self) -> RelayResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(RelayError::NotActive)
        }
    }

    fn fail<T>(&self, error: RelayError) -> RelayResult<T> {
        tracing::warn!("Relay connection to {} failed: {}", self.relay, error);
        mark_failed(&self.state);
        Err(RelayError::ConnectionFailed(error.to_string()))
    }

    async fn expect_ack(&self, body: Body) -> RelayResult<()> {
        match self.exchange(body, self.config.request_timeout).await {
            Ok(Body::Ack) => Ok(()),
            Ok(other) => self.fail(RelayError::UnexpectedReply(other.name())),
            Err(e) => self.fail(e),
        }
    }

    /// One request/response with the relay. Error replies become errors.
    async fn exchange(&self, body: Body, timeout: Duration) -> RelayResult<Body> {
        let request = Envelope::new(
            self.local.current().as_ref().clone(),
            Some(self.relay.id()),
            body,
        );
        let reply = round_trip(self.transport.as_ref(), self.relay_addr(), &request, timeout).await?;
        check_relay_reply(reply, self.relay.id(), self.relay_addr())
    }
}

/// Verify the answer came from the relay and unwrap error replies.
fn check_relay_reply(reply: Envelope, relay_id: PeerId, relay_addr: SocketAddr) -> RelayResult<Body> {
    if reply.sender.id() != relay_id {
        return Err(RelayError::IdentityMismatch {
            expected: relay_id,
            actual: reply.sender.id(),
        });
    }
    match reply.body {
        Body::Error { code, message } => Err(RelayError::from_code(code, message, relay_addr)),
        body => Ok(body),
    }
}

/// Delivers drained outbound batches to the relay as one `Relay` request
struct RelaySink {
    transport: Arc<dyn Transport>,
    relay_addr: SocketAddr,
    relay_id: PeerId,
    local: PublishedAddress,
    timeout: Duration,
    state: SharedState,
}

#[async_trait]
impl BatchSink<Queued<Outbound>> for RelaySink {
    async fn deliver(&self, batch: Vec<Queued<Outbound>>) {
        let (messages, slots) = split_batch(batch);
        if messages.is_empty() {
            return;
        }
        let count = messages.len();
        let request = Envelope::new(
            self.local.current().as_ref().clone(),
            Some(self.relay_id),
            Body::Relay { messages },
        );

        let delivered = match round_trip(self.transport.as_ref(), self.relay_addr, &request, self.timeout).await {
            Ok(reply) if reply.sender.id() == self.relay_id => resolve_batch(slots, &reply),
            Ok(reply) => {
                tracing::warn!("Batch reply from unexpected peer {}", reply.sender.id());
                false
            }
            Err(e) => {
                tracing::debug!("Batch of {} to relay {} failed: {}", count, self.relay_addr, e);
                false
            }
        };

        if delivered {
            tracing::trace!("Relayed batch of {} through {}", count, self.relay_addr);
        } else {
            mark_failed(&self.state);
        }
    }
}
