//! Async UDP request/response transport.
//!
//! Every datagram carries one [`Frame`]: a request with a locally unique id,
//! or the response to such a request. Outstanding requests are matched to
//! their responses through oneshot channels keyed by id, and only the address
//! a request went to can answer it. Inbound requests are
//! handed to the installed [`RequestHandler`] on their own task so a slow
//! handler never stalls the receive loop.

use crate::transport::{RequestHandler, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Socket buffer size requested from the kernel
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Datagram frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
enum Frame {
    /// Request expecting a response with the same id
    Request { id: u64, payload: Vec<u8> },
    /// Response to request `id`; `None` if the handler produced nothing
    Response { id: u64, payload: Option<Vec<u8>> },
}

impl Frame {
    fn to_bytes(&self) -> TransportResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TransportError::Codec(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> TransportResult<Self> {
        bincode::deserialize(bytes).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

/// Outstanding request waiting for the response from `addr`
struct Pending {
    addr: SocketAddr,
    reply: oneshot::Sender<Option<Vec<u8>>>,
}

type PendingMap = HashMap<u64, Pending>;

/// Removes a request's pending entry when `send_request` returns or its
/// future is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingMap>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

struct Inner {
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    handler: RwLock<Option<Weak<dyn RequestHandler>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    requests_sent: AtomicU64,
    requests_served: AtomicU64,
    request_failures: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut receiver) = self.receiver.lock() {
            if let Some(handle) = receiver.take() {
                handle.abort();
            }
        }
    }
}

/// Async UDP transport using Tokio.
///
/// # Examples
///
/// ```no_run
/// use tether_transport::udp::UdpTransport;
/// use tether_transport::transport::Transport;
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let transport = UdpTransport::bind(addr).await?;
/// println!("Listening on {}", transport.local_addr()?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<Inner>,
}

impl UdpTransport {
    /// Create a new UDP transport bound to the given address and start its
    /// receive loop.
    ///
    /// # Arguments
    /// * `addr` - The local address to bind to. Use "0.0.0.0:0" for automatic port selection.
    ///
    /// # Errors
    /// Returns `TransportError` if binding fails
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        let addr = addr.into();

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_send_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        Ok(Self::from_socket(socket))
    }

    /// Create from an existing Tokio UdpSocket and start its receive loop.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        let socket = Arc::new(socket);
        let inner = Arc::new(Inner {
            socket: socket.clone(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(rand::random::<u32>() as u64),
            pending: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            receiver: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            request_failures: AtomicU64::new(0),
        });

        let handle = tokio::spawn(receive_loop(socket, Arc::downgrade(&inner)));
        if let Ok(mut receiver) = inner.receiver.lock() {
            *receiver = Some(handle);
        }

        Self { inner }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.pending.lock().map(|p| p.len()).unwrap_or_default()
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, inner: Weak<Inner>) {
    let mut buf = vec![0u8; 65_536];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms
                tracing::trace!("UDP receive error: {}", e);
                match inner.upgrade() {
                    Some(inner) if !inner.closed.load(Ordering::Relaxed) => continue,
                    _ => break,
                }
            }
        };

        let Some(inner) = inner.upgrade() else { break };
        if inner.closed.load(Ordering::Relaxed) {
            break;
        }
        inner.bytes_received.fetch_add(len as u64, Ordering::Relaxed);

        let frame = match Frame::from_bytes(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Dropping malformed datagram from {}: {}", from, e);
                continue;
            }
        };

        match frame {
            Frame::Request { id, payload } => {
                let handler = inner
                    .handler
                    .read()
                    .ok()
                    .and_then(|guard| guard.as_ref().and_then(Weak::upgrade));
                let inner = inner.clone();
                tokio::spawn(async move {
                    let response = match handler {
                        Some(handler) => handler.handle(from, payload).await,
                        None => None,
                    };
                    inner.requests_served.fetch_add(1, Ordering::Relaxed);
                    let frame = Frame::Response {
                        id,
                        payload: response,
                    };
                    match frame.to_bytes() {
                        Ok(bytes) if bytes.len() <= MAX_DATAGRAM_SIZE => {
                            match inner.socket.send_to(&bytes, from).await {
                                Ok(sent) => {
                                    inner.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                                }
                                Err(e) => tracing::debug!("Failed to answer {}: {}", from, e),
                            }
                        }
                        Ok(bytes) => {
                            tracing::warn!(
                                "Response to {} dropped: {} bytes exceeds datagram size",
                                from,
                                bytes.len()
                            );
                        }
                        Err(e) => tracing::warn!("Failed to encode response: {}", e),
                    }
                });
            }
            Frame::Response { id, payload } => {
                let waiter = inner.pending.lock().ok().and_then(|mut pending| {
                    match pending.get(&id).map(|entry| entry.addr) {
                        Some(addr) if addr == from => pending.remove(&id),
                        Some(addr) => {
                            tracing::debug!(
                                "Ignoring response {} from {}, request went to {}",
                                id,
                                from,
                                addr
                            );
                            None
                        }
                        None => {
                            tracing::trace!("Late or unknown response {} from {}", id, from);
                            None
                        }
                    }
                });
                if let Some(waiter) = waiter {
                    let _ = waiter.reply.send(payload);
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_request(
        &self,
        addr: SocketAddr,
        request: Vec<u8>,
        timeout: Duration,
    ) -> TransportResult<Vec<u8>> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = Frame::Request {
            id,
            payload: request,
        }
        .to_bytes()?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::PayloadTooLarge(bytes.len()));
        }

        let (reply, rx) = oneshot::channel();
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.insert(id, Pending { addr, reply });
        }
        let _entry = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        self.inner.requests_sent.fetch_add(1, Ordering::Relaxed);
        match self.inner.socket.send_to(&bytes, addr).await {
            Ok(sent) => {
                self.inner
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.inner.request_failures.fetch_add(1, Ordering::Relaxed);
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    return Err(TransportError::ConnectionRefused(addr));
                }
                return Err(TransportError::Io(e));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => {
                self.inner.request_failures.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::NoResponse(addr))
            }
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.inner.request_failures.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Timeout(addr))
            }
        }
    }

    fn serve(&self, handler: Weak<dyn RequestHandler>) {
        if let Ok(mut guard) = self.inner.handler.write() {
            *guard = Some(handler);
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.inner.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        if let Ok(mut receiver) = self.inner.receiver.lock() {
            if let Some(handle) = receiver.take() {
                handle.abort();
            }
        }
        // Dropping the senders wakes every waiter with `Closed`
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.clear();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            requests_sent: self.inner.requests_sent.load(Ordering::Relaxed),
            requests_served: self.inner.requests_served.load(Ordering::Relaxed),
            request_failures: self.inner.request_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _from: SocketAddr, request: Vec<u8>) -> Option<Vec<u8>> {
            let mut response = b"echo:".to_vec();
            response.extend_from_slice(&request);
            Some(response)
        }
    }

    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn handle(&self, _from: SocketAddr, _request: Vec<u8>) -> Option<Vec<u8>> {
            None
        }
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_udp_bind() {
        let transport = UdpTransport::bind(localhost()).await.unwrap();
        let bound_addr = transport.local_addr().unwrap();
        assert_ne!(bound_addr.port(), 0);
        assert!(bound_addr.is_ipv4());
    }

    #[tokio::test]
    async fn test_udp_request_response() {
        let server = UdpTransport::bind(localhost()).await.unwrap();
        let handler: Arc<dyn RequestHandler> = Arc::new(Echo);
        server.serve(Arc::downgrade(&handler));

        let client = UdpTransport::bind(localhost()).await.unwrap();
        let response = client
            .send_request(
                server.local_addr().unwrap(),
                b"hello".to_vec(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        assert_eq!(response, b"echo:hello");
        assert_eq!(client.stats().requests_sent, 1);
        assert_eq!(server.stats().requests_served, 1);
    }

    #[tokio::test]
    async fn test_udp_no_response() {
        let server = UdpTransport::bind(localhost()).await.unwrap();
        let handler: Arc<dyn RequestHandler> = Arc::new(Silent);
        server.serve(Arc::downgrade(&handler));

        let client = UdpTransport::bind(localhost()).await.unwrap();
        let result = client
            .send_request(
                server.local_addr().unwrap(),
                b"hello".to_vec(),
                Duration::from_secs(2),
            )
            .await;

        assert!(matches!(result, Err(TransportError::NoResponse(_))));
    }

    #[tokio::test]
    async fn test_udp_timeout() {
        // Bound but never read, so the request is never answered
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpTransport::bind(localhost()).await.unwrap();

        let result = client
            .send_request(
                sink.local_addr().unwrap(),
                b"hello".to_vec(),
                Duration::from_millis(100),
            )
            .await;

        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert_eq!(client.stats().request_failures, 1);
    }

    #[tokio::test]
    async fn test_udp_close() {
        let transport = UdpTransport::bind(localhost()).await.unwrap();
        assert!(!transport.is_closed());

        transport.close().await.unwrap();
        assert!(transport.is_closed());

        let result = transport
            .send_request(
                "127.0.0.1:9".parse().unwrap(),
                vec![1],
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[test]
    fn test_frame_codec() {
        let frame = Frame::Response {
            id: 7,
            payload: Some(vec![1, 2, 3]),
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
        assert!(Frame::from_bytes(&[0xFF, 0xFF]).is_err());
    }

    #[tokio::test]
    async fn test_udp_abandoned_request_forgets_pending() {
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpTransport::bind(localhost()).await.unwrap();

        let request = client.send_request(
            sink.local_addr().unwrap(),
            b"hello".to_vec(),
            Duration::from_secs(30),
        );
        let outer = tokio::time::timeout(Duration::from_millis(100), request).await;

        assert!(outer.is_err());
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_udp_response_from_other_address_ignored() {
        let server = UdpSocket::bind(localhost()).await.unwrap();
        let impostor = UdpSocket::bind(localhost()).await.unwrap();
        let client = UdpTransport::bind(localhost()).await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let answer = async {
            let mut buf = vec![0u8; 1024];
            let (len, _) = server.recv_from(&mut buf).await.unwrap();
            let Frame::Request { id, .. } = Frame::from_bytes(&buf[..len]).unwrap() else {
                panic!("expected a request");
            };

            let forged = Frame::Response {
                id,
                payload: Some(b"forged".to_vec()),
            };
            impostor
                .send_to(&forged.to_bytes().unwrap(), client_addr)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            let genuine = Frame::Response {
                id,
                payload: Some(b"genuine".to_vec()),
            };
            server
                .send_to(&genuine.to_bytes().unwrap(), client_addr)
                .await
                .unwrap();
        };

        let (response, ()) = tokio::join!(
            client.send_request(
                server.local_addr().unwrap(),
                b"hello".to_vec(),
                Duration::from_secs(2),
            ),
            answer
        );
        assert_eq!(response.unwrap(), b"genuine");
        assert_eq!(client.pending_len(), 0);
    }
}
