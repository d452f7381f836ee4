//! Direct/relay dispatcher.
//!
//! Sends a request to a peer directly first and, when that fails and the
//! peer advertises relays, through each relay in advertised order. The
//! answer must come from the addressed peer whichever path carried it.

use crate::error::DispatchError;
use crate::message::{Body, Envelope};
use crate::peer::{PeerAddress, PeerSocketAddress, PublishedAddress};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_transport::{Transport, TransportError};

/// Path that delivered a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Straight to the destination's primary endpoint
    Direct,
    /// Through the relay at this address
    Relayed(PeerSocketAddress),
}

impl std::fmt::Display for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "Direct"),
            Self::Relayed(relay) => write!(f, "Relayed({relay})"),
        }
    }
}

/// Answer to a dispatched request
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Reply sent by the destination
    pub reply: Envelope,
    /// Path that carried it
    pub delivery: Delivery,
}

/// Why one path failed
enum PathFailure {
    /// The local transport is closed; no other path can work either
    Closed,
    /// This path did not produce an answer from the destination
    Failed(String),
}

/// Direct/relay dispatcher
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    published: PublishedAddress,
    request_timeout: Duration,
    relay_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher sending as the currently published address.
    ///
    /// # Arguments
    ///
    /// * `request_timeout` - bound on the direct attempt
    /// * `relay_timeout` - bound on each attempt through a relay
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        published: PublishedAddress,
        request_timeout: Duration,
        relay_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            published,
            request_timeout,
            relay_timeout,
        }
    }

    /// Send `body` to `destination` and return its reply.
    ///
    /// Relays are only tried when direct delivery fails and the destination
    /// advertises itself as relayed.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Unreachable` when the direct path and every
    /// relay failed, `DispatchError::Closed` if the local transport is
    /// closed, and `DispatchError::Wire` if the request cannot be encoded.
    pub async fn send_message(
        &self,
        destination: &PeerAddress,
        body: Body,
    ) -> Result<DispatchOutcome, DispatchError> {
        let sender = self.published.current().as_ref().clone();
        let request = Envelope::new(sender, Some(destination.id()), body);
        let bytes = request.to_bytes()?;
        let mut attempts = 0;

        if let Some(endpoint) = destination.primary_endpoint() {
            attempts += 1;
            match self
                .attempt(&request, destination, endpoint.udp_addr(), bytes.clone(), self.request_timeout)
                .await
            {
                Ok(reply) => {
                    return Ok(DispatchOutcome {
                        reply,
                        delivery: Delivery::Direct,
                    });
                }
                Err(PathFailure::Closed) => return Err(DispatchError::Closed),
                Err(PathFailure::Failed(reason)) => {
                    tracing::trace!("Direct delivery to {} failed: {}", destination.id(), reason);
                }
            }
        }

        if destination.is_relayed() {
            for relay in destination.relays() {
                attempts += 1;
                match self
                    .attempt(&request, destination, relay.udp_addr(), bytes.clone(), self.relay_timeout)
                    .await
                {
                    Ok(reply) => {
                        tracing::debug!("Reached {} via relay {}", destination.id(), relay);
                        return Ok(DispatchOutcome {
                            reply,
                            delivery: Delivery::Relayed(*relay),
                        });
                    }
                    Err(PathFailure::Closed) => return Err(DispatchError::Closed),
                    Err(PathFailure::Failed(reason)) => {
                        tracing::debug!("Relay {} failed for {}: {}", relay, destination.id(), reason);
                    }
                }
            }
        }

        tracing::debug!("{} unreachable after {} attempts", destination.id(), attempts);
        Err(DispatchError::Unreachable {
            peer: destination.id(),
            attempts,
        })
    }

    async fn attempt(
        &self,
        request: &Envelope,
        destination: &PeerAddress,
        addr: SocketAddr,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<Envelope, PathFailure> {
        let response = match self.transport.send_request(addr, bytes, timeout).await {
            Ok(response) => response,
            Err(TransportError::Closed) => return Err(PathFailure::Closed),
            Err(e) => return Err(PathFailure::Failed(e.to_string())),
        };

        let reply = Envelope::from_bytes(&response).map_err(|e| PathFailure::Failed(e.to_string()))?;
        if reply.id != request.id {
            return Err(PathFailure::Failed(format!("reply to another request from {addr}")));
        }
        if reply.sender.id() != destination.id() {
            return Err(PathFailure::Failed(format!(
                "answered by {} instead",
                reply.sender.id()
            )));
        }
        Ok(reply)
    }
}
