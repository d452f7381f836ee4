//! Error types for the relay layer.

use crate::message::ErrorCode;
use crate::peer::PeerId;
use std::net::SocketAddr;
use tether_transport::TransportError;
use thiserror::Error;

/// Errors from decoding or encoding wire records
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the record was complete
    #[error("Truncated record: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes required by the next field
        needed: usize,
        /// Bytes left in the input
        remaining: usize,
    },

    /// Flag byte carries bits with no defined meaning
    #[error("Unknown flag bits: {0:#04x}")]
    UnknownFlags(u8),

    /// Socket address family is neither 4 nor 6
    #[error("Unknown address family: {0}")]
    UnknownFamily(u8),

    /// The relayed flag disagrees with the relay list
    #[error("Relayed flag does not match relay count {0}")]
    RelayFlagMismatch(usize),

    /// A list has more entries than the record can carry
    #[error("Too many entries: {0}")]
    TooManyEntries(usize),

    /// Input continues past the end of the record
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    /// Frame serialization failed
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Relay setup, forwarding and configuration errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// No candidate accepted a relay registration
    #[error("No relay available: every candidate was rejected or unreachable")]
    RelayUnavailable,

    /// A relay server is at its registration capacity
    #[error("Relay server {0} is at capacity")]
    CapacityExceeded(SocketAddr),

    /// Keep-alive, send or registration round trip failed
    #[error("Relay connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer is not registered with the relay server
    #[error("Peer {0} is not registered")]
    NotRegistered(PeerId),

    /// Relay server rejected a request
    #[error("Rejected by relay ({code:?}): {message}")]
    Rejected {
        /// Error code reported by the server
        code: ErrorCode,
        /// Server-provided detail
        message: String,
    },

    /// Reply body did not match the request
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(&'static str),

    /// Reply came from a different peer than the one addressed
    #[error("Reply from {actual} while expecting {expected}")]
    IdentityMismatch {
        /// Peer the request was addressed to
        expected: PeerId,
        /// Peer the reply claims to come from
        actual: PeerId,
    },

    /// Operation did not complete in time
    #[error("Relay operation timed out")]
    Timeout,

    /// The connection is not in a state that allows the operation
    #[error("Relay connection is not active")]
    NotActive,

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The relay manager or peer is shutting down
    #[error("Shut down")]
    Shutdown,

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire codec failure
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}

impl RelayError {
    /// Map an error reply from a relay server at `addr` onto a relay error.
    #[must_use]
    pub fn from_code(code: ErrorCode, message: String, addr: SocketAddr) -> Self {
        match code {
            ErrorCode::ServerFull => RelayError::CapacityExceeded(addr),
            code => RelayError::Rejected { code, message },
        }
    }
}

/// Errors surfaced by the direct/relay dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Direct delivery and every advertised relay failed
    #[error("Peer {peer} unreachable after {attempts} attempts")]
    Unreachable {
        /// Destination peer
        peer: PeerId,
        /// Paths tried, direct included
        attempts: usize,
    },

    /// The envelope could not be encoded
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Local transport is closed
    #[error("Local transport is closed")]
    Closed,
}

/// Result alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_display() {
        let err = WireError::Truncated {
            needed: 20,
            remaining: 3,
        };
        assert_eq!(
            err.to_string(),
            "Truncated record: needed 20 bytes, 3 remaining"
        );
        assert_eq!(
            WireError::UnknownFlags(0x18).to_string(),
            "Unknown flag bits: 0x18"
        );
    }

    #[test]
    fn test_error_from_code() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let err = RelayError::from_code(ErrorCode::ServerFull, "full".to_string(), addr);
        assert!(matches!(err, RelayError::CapacityExceeded(a) if a == addr));

        let err = RelayError::from_code(ErrorCode::UnsupportedKind, "kind".to_string(), addr);
        assert!(matches!(
            err,
            RelayError::Rejected {
                code: ErrorCode::UnsupportedKind,
                ..
            }
        ));
    }

    #[test]
    fn test_transport_error_conversion() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let err: RelayError = TransportError::Timeout(addr).into();
        assert!(matches!(err, RelayError::Transport(_)));
    }
}
