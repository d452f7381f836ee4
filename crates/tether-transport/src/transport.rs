//! Transport trait abstraction for request/response delivery.
//!
//! This module defines the `Transport` trait used by the relay layer: a
//! generic "send a request, await the response or a failure" primitive. Both
//! the UDP transport and the in-process simulated network implement it, so
//! the relay logic never touches sockets directly.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// No response arrived before the deadline
    #[error("Request to {0} timed out")]
    Timeout(SocketAddr),

    /// Remote endpoint actively refused or is not listening
    #[error("Connection refused by {0}")]
    ConnectionRefused(SocketAddr),

    /// Remote endpoint accepted the request but produced no response
    #[error("No response from {0}")]
    NoResponse(SocketAddr),

    /// Request or response exceeds the maximum datagram size
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Frame could not be encoded or decoded
    #[error("Frame codec error: {0}")]
    Codec(String),
}

impl TransportError {
    /// Whether the failure means the remote could not be reached at all
    /// (as opposed to a local failure such as a closed transport).
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::ConnectionRefused(_)
                | TransportError::NoResponse(_)
                | TransportError::Io(_)
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Handler for inbound requests.
///
/// The transport invokes the handler for every request it receives and sends
/// the returned bytes back as the response. Returning `None` means the
/// request is answered with nothing and the requester observes
/// [`TransportError::NoResponse`] or a timeout.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request from `from`, returning the response payload.
    async fn handle(&self, from: SocketAddr, request: Vec<u8>) -> Option<Vec<u8>>;
}

/// Async request/response transport.
///
/// # Examples
///
/// ```no_run
/// use tether_transport::transport::Transport;
/// use tether_transport::udp::UdpTransport;
/// use std::net::SocketAddr;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let transport = UdpTransport::bind(addr).await?;
///
/// let response = transport
///     .send_request("127.0.0.1:50000".parse()?, b"ping".to_vec(), Duration::from_secs(2))
///     .await?;
/// println!("Received {} bytes", response.len());
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request to `addr` and wait at most `timeout` for its response.
    ///
    /// # Errors
    /// Returns `TransportError` if the request cannot be sent, the remote is
    /// unreachable, or no response arrives in time.
    async fn send_request(
        &self,
        addr: SocketAddr,
        request: Vec<u8>,
        timeout: Duration,
    ) -> TransportResult<Vec<u8>>;

    /// Install the handler for inbound requests.
    ///
    /// The transport keeps only a weak reference so the owner of the handler
    /// controls its lifetime.
    fn serve(&self, handler: Weak<dyn RequestHandler>);

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport and release resources.
    ///
    /// After calling this method, all subsequent operations should
    /// return `TransportError::Closed`.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Requests sent
    pub requests_sent: u64,
    /// Requests served
    pub requests_served: u64,
    /// Requests that failed or timed out
    pub request_failures: u64,
}
