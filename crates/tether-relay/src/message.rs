//! Relay protocol messages.
//!
//! Every request and response is an [`Envelope`]: a message id, the sender's
//! full address record, the intended recipient and a [`Body`]. A response
//! reuses the id of the request it answers. Envelopes are serialized with
//! bincode; the embedded address records use their own wire format.

use crate::error::WireError;
use crate::peer::{PeerAddress, PeerId, PeerSocketAddress};
use crate::strategy::RelayKind;
use serde::{Deserialize, Serialize};

/// Relay error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Sender is not registered with this relay
    NotRegistered = 1,
    /// Recipient is not known here
    PeerNotFound = 2,
    /// Relay is at registration capacity
    ServerFull = 3,
    /// Relay does not serve the requested relay kind
    UnsupportedKind = 4,
    /// No handler for this message
    NoHandler = 5,
    /// Message not valid in this context
    InvalidMessage = 6,
    /// Relay could not deliver to the registered peer
    DeliveryFailed = 7,
}

/// A message the relay should send on behalf of its registrant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outbound {
    /// Where to deliver
    pub destination: PeerSocketAddress,
    /// What to deliver
    pub envelope: Envelope,
}

/// Message bodies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Body {
    /// Liveness check; also announces the sender's address
    Ping,
    /// Answer to [`Body::Ping`]
    Pong,

    /// Ask the recipient to relay for the sender
    Register {
        /// Relay kind the sender wants
        kind: RelayKind,
    },
    /// Registration accepted
    RegisterAck {
        /// Identity of the accepting relay
        relay_id: PeerId,
    },
    /// End a registration
    Deregister,
    /// Keep a registration alive
    KeepAlive,
    /// Generic positive acknowledgement
    Ack,

    /// Registrant's current verified neighbors, mirrored by the relay
    PeerMapUpdate {
        /// Neighbor snapshot
        neighbors: Vec<PeerAddress>,
    },
    /// Ask for neighbors close to `target`
    NeighborQuery {
        /// Lookup target
        target: PeerId,
    },
    /// Answer to [`Body::NeighborQuery`]
    NeighborReply {
        /// Neighbors closest to the target, closest first
        neighbors: Vec<PeerAddress>,
    },

    /// Application payload
    Data {
        /// Opaque bytes
        payload: Vec<u8>,
    },
    /// Application response
    DataReply {
        /// Opaque bytes
        payload: Vec<u8>,
    },

    /// Registrant to relay: deliver these messages for me
    Relay {
        /// Messages in send order
        messages: Vec<Outbound>,
    },
    /// Relay to registrant: buffered messages addressed to you
    Batch {
        /// Envelopes in arrival order
        envelopes: Vec<Envelope>,
    },
    /// Answers to a [`Body::Relay`] or [`Body::Batch`], in the same order
    BatchReply {
        /// One entry per message; `None` if that message got no answer
        replies: Vec<Option<Envelope>>,
    },

    /// Request failed
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable detail
        message: String,
    },
}

impl Body {
    /// Get the message type name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Body::Ping => "Ping",
            Body::Pong => "Pong",
            Body::Register { .. } => "Register",
            Body::RegisterAck { .. } => "RegisterAck",
            Body::Deregister => "Deregister",
            Body::KeepAlive => "KeepAlive",
            Body::Ack => "Ack",
            Body::PeerMapUpdate { .. } => "PeerMapUpdate",
            Body::NeighborQuery { .. } => "NeighborQuery",
            Body::NeighborReply { .. } => "NeighborReply",
            Body::Data { .. } => "Data",
            Body::DataReply { .. } => "DataReply",
            Body::Relay { .. } => "Relay",
            Body::Batch { .. } => "Batch",
            Body::BatchReply { .. } => "BatchReply",
            Body::Error { .. } => "Error",
        }
    }
}

/// Protocol envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Message id; responses carry the id of their request
    pub id: u64,
    /// Sender's address record at send time
    pub sender: PeerAddress,
    /// Intended recipient; `None` for whoever listens at the target address
    pub recipient: Option<PeerId>,
    /// Message body
    pub body: Body,
}

impl Envelope {
    /// Create a request with a fresh random id.
    #[must_use]
    pub fn new(sender: PeerAddress, recipient: Option<PeerId>, body: Body) -> Self {
        Self {
            id: rand::random(),
            sender,
            recipient,
            body,
        }
    }

    /// Build the response to this envelope.
    #[must_use]
    pub fn reply(&self, sender: PeerAddress, body: Body) -> Self {
        Self {
            id: self.id,
            sender,
            recipient: Some(self.sender.id()),
            body,
        }
    }

    /// Build an error response to this envelope.
    #[must_use]
    pub fn error(&self, sender: PeerAddress, code: ErrorCode, message: impl Into<String>) -> Self {
        self.reply(
            sender,
            Body::Error {
                code,
                message: message.into(),
            },
        )
    }

    /// Whether the body is an error
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.body, Body::Error { .. })
    }

    /// Whether this envelope is addressed to someone other than `local`
    #[must_use]
    pub fn is_for_other(&self, local: &PeerId) -> bool {
        self.recipient.is_some_and(|id| id != *local)
    }

    /// Serialize the envelope to bytes
    ///
    /// # Errors
    /// Returns `WireError::Codec` if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(|e| WireError::Codec(e.to_string()))
    }

    /// Deserialize an envelope from bytes
    ///
    /// # Errors
    /// Returns `WireError` if the bytes are not a valid envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(bytes).map_err(|e| WireError::Codec(e.to_string()))
    }

    /// Serialized size in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).map_or(0, |len| len as usize)
    }
}
