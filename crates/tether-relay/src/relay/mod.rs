//! # Relay connections
//!
//! Unreachable peers register with reachable peers that then forward
//! messages addressed to them.
//!
//! ## Architecture
//!
//! ```text
//!   sender ──── direct (dropped by NAT) ────X   unreachable peer
//!      │                                              ▲
//!      │  Envelope{recipient = unreachable}           │ Register / KeepAlive /
//!      ▼                                              │ PeerMapUpdate / Relay
//!   relay server ─── forward (immediate or Batch) ────┘
//! ```
//!
//! - [`RelayClient`] runs on the unreachable peer, one per relay.
//! - [`RelayServer`] runs on a reachable peer and holds the registrations.
//! - [`CandidatePool`] orders untried relay candidates for the manager.
//!
//! Both ends share the same request/response helpers: every exchange is one
//! [`Envelope`] sent through the [`Transport`] and one envelope back with the
//! same id.

pub mod client;
pub mod selection;
pub mod server;

pub use client::{RelayClient, RelayConnectionState};
pub use selection::CandidatePool;
pub use server::RelayServer;

use crate::buffer::{BufferItem, BufferPipe};
use crate::error::{RelayError, RelayResult};
use crate::message::{Body, Envelope};
use crate::strategy::BufferLimits;
use std::net::SocketAddr;
use std::time::Duration;
use tether_transport::Transport;
use tokio::sync::oneshot;

/// Upper bound on how long a buffered message waits for its batch
const MAX_BATCH_WAIT: Duration = Duration::from_secs(60);

/// A buffered message together with the slot its answer goes to
pub(crate) struct Queued<M> {
    pub(crate) message: M,
    pub(crate) reply: oneshot::Sender<Option<Envelope>>,
}

impl<M: BufferItem> BufferItem for Queued<M> {
    fn size(&self) -> usize {
        self.message.size()
    }
}

/// Split a drained batch into the messages and their reply slots. Messages
/// whose sender stopped waiting are left out and never delivered.
pub(crate) fn split_batch<M>(batch: Vec<Queued<M>>) -> (Vec<M>, Vec<oneshot::Sender<Option<Envelope>>>) {
    let total = batch.len();
    let (messages, slots): (Vec<M>, Vec<_>) = batch
        .into_iter()
        .filter(|queued| !queued.reply.is_closed())
        .map(|queued| (queued.message, queued.reply))
        .unzip();

    if messages.len() < total {
        tracing::debug!("Skipping {} abandoned messages", total - messages.len());
    }
    (messages, slots)
}

/// Hand each answer to its slot. Returns whether the answers matched the
/// batch; on mismatch every slot is dropped unanswered.
pub(crate) fn resolve_batch(
    slots: Vec<oneshot::Sender<Option<Envelope>>>,
    reply: &Envelope,
) -> bool {
    match &reply.body {
        Body::BatchReply { replies } if replies.len() == slots.len() => {
            for (slot, answer) in slots.into_iter().zip(replies.iter().cloned()) {
                let _ = slot.send(answer);
            }
            true
        }
        _ => false,
    }
}

/// How long a buffered message may wait for its answer: until the buffer
/// drains plus one round trip. A one-message buffer drains on every enqueue.
pub(crate) fn batch_wait(limits: BufferLimits, round_trip: Duration) -> Duration {
    if limits.max_count <= 1 {
        return round_trip;
    }
    limits
        .max_age
        .min(MAX_BATCH_WAIT)
        .saturating_add(round_trip)
}

/// Enqueue `message` and wait for the answer carried by its batch.
///
/// # Errors
/// Returns `RelayError::Shutdown` if the pipe is closed,
/// `RelayError::Timeout` if no answer arrives within `wait`, and
/// `RelayError::ConnectionFailed` if the batch could not be delivered.
pub(crate) async fn enqueue_and_wait<M: BufferItem + Send + 'static>(
    pipe: &BufferPipe<Queued<M>>,
    message: M,
    wait: Duration,
) -> RelayResult<Option<Envelope>> {
    let (tx, rx) = oneshot::channel();
    pipe.enqueue(Queued { message, reply: tx })?;

    match tokio::time::timeout(wait, rx).await {
        Ok(Ok(answer)) => Ok(answer),
        Ok(Err(_)) => Err(RelayError::ConnectionFailed(
            "batch was not delivered".to_string(),
        )),
        Err(_) => Err(RelayError::Timeout),
    }
}

/// Send `request` to `addr` and decode the answer.
///
/// # Errors
/// Returns `RelayError::Transport` or `RelayError::Wire` on delivery or codec
/// failure, and `RelayError::UnexpectedReply` if the answer carries another
/// message id.
pub(crate) async fn round_trip(
    transport: &dyn Transport,
    addr: SocketAddr,
    request: &Envelope,
    timeout: Duration,
) -> RelayResult<Envelope> {
    let bytes = request.to_bytes()?;
    let response = transport.send_request(addr, bytes, timeout).await?;
    let reply = Envelope::from_bytes(&response)?;

    if reply.id != request.id {
        return Err(RelayError::UnexpectedReply("reply id does not match request"));
    }
    Ok(reply)
}
