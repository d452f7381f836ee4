//! Peer address records and their wire format.
//!
//! A [`PeerAddress`] is immutable: every change (new relay, flag flip) builds
//! a new value. The `relayed` flag is derived from the relay list, so the two
//! can never disagree.
//!
//! Wire layout, big-endian:
//!
//! ```text
//! peer id           20 bytes
//! flags             1 byte   bit0 firewalledTCP, bit1 firewalledUDP, bit2 relayed
//! endpoint count    1 byte   followed by that many socket addresses
//! relay count       1 byte   followed by that many socket addresses
//! socket address    1 byte family (4 | 6), 4 or 16 address bytes,
//!                   2 bytes TCP port, 2 bytes UDP port
//! ```

use super::PeerId;
use crate::error::WireError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;

/// Maximum number of direct endpoints in one record
pub const MAX_ENDPOINTS: usize = 8;

/// Maximum number of relay addresses in one record
pub const MAX_RELAYS: usize = 16;

const FLAG_FIREWALLED_TCP: u8 = 0b001;
const FLAG_FIREWALLED_UDP: u8 = 0b010;
const FLAG_RELAYED: u8 = 0b100;
const FLAG_MASK: u8 = FLAG_FIREWALLED_TCP | FLAG_FIREWALLED_UDP | FLAG_RELAYED;

/// (IP, TCP port, UDP port) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerSocketAddress {
    /// IP address
    pub ip: IpAddr,
    /// TCP port
    pub tcp_port: u16,
    /// UDP port
    pub udp_port: u16,
}

impl PeerSocketAddress {
    /// Create a socket address with distinct TCP and UDP ports.
    #[must_use]
    pub const fn new(ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            ip,
            tcp_port,
            udp_port,
        }
    }

    /// Address used by the datagram transport.
    #[must_use]
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    fn encoded_len(&self) -> usize {
        match self.ip {
            IpAddr::V4(_) => 1 + 4 + 4,
            IpAddr::V6(_) => 1 + 16 + 4,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self.ip {
            IpAddr::V4(ip) => {
                out.push(4);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(6);
                out.extend_from_slice(&ip.octets());
            }
        }
        out.extend_from_slice(&self.tcp_port.to_be_bytes());
        out.extend_from_slice(&self.udp_port.to_be_bytes());
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let ip = match reader.u8()? {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(reader.take(4)?);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(reader.take(16)?);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            family => return Err(WireError::UnknownFamily(family)),
        };
        let tcp_port = reader.u16()?;
        let udp_port = reader.u16()?;
        Ok(Self::new(ip, tcp_port, udp_port))
    }
}

impl From<SocketAddr> for PeerSocketAddress {
    /// The same port is used for TCP and UDP.
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port(), addr.port())
    }
}

impl fmt::Display for PeerSocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tcp_port == self.udp_port {
            write!(f, "{}", self.udp_addr())
        } else {
            write!(f, "{} (tcp {})", self.udp_addr(), self.tcp_port)
        }
    }
}

/// Network address record of a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    id: PeerId,
    endpoints: Vec<PeerSocketAddress>,
    firewalled_tcp: bool,
    firewalled_udp: bool,
    relays: Vec<PeerSocketAddress>,
}

impl PeerAddress {
    /// Create a record with one reachable endpoint and no relays.
    #[must_use]
    pub fn new(id: PeerId, endpoint: impl Into<PeerSocketAddress>) -> Self {
        Self {
            id,
            endpoints: vec![endpoint.into()],
            firewalled_tcp: false,
            firewalled_udp: false,
            relays: Vec::new(),
        }
    }

    /// Create a record that only carries an identity.
    #[must_use]
    pub fn without_endpoint(id: PeerId) -> Self {
        Self {
            id,
            endpoints: Vec::new(),
            firewalled_tcp: false,
            firewalled_udp: false,
            relays: Vec::new(),
        }
    }

    /// Peer identity
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Direct endpoints, primary first
    #[must_use]
    pub fn endpoints(&self) -> &[PeerSocketAddress] {
        &self.endpoints
    }

    /// Endpoint used for direct delivery
    #[must_use]
    pub fn primary_endpoint(&self) -> Option<PeerSocketAddress> {
        self.endpoints.first().copied()
    }

    /// Relay socket addresses, oldest first
    #[must_use]
    pub fn relays(&self) -> &[PeerSocketAddress] {
        &self.relays
    }

    /// Whether inbound TCP is blocked
    #[must_use]
    pub fn is_firewalled_tcp(&self) -> bool {
        self.firewalled_tcp
    }

    /// Whether inbound UDP is blocked
    #[must_use]
    pub fn is_firewalled_udp(&self) -> bool {
        self.firewalled_udp
    }

    /// Whether either transport is blocked
    #[must_use]
    pub fn is_firewalled(&self) -> bool {
        self.firewalled_tcp || self.firewalled_udp
    }

    /// Whether the peer is reachable through relays. True iff the relay list
    /// is non-empty.
    #[must_use]
    pub fn is_relayed(&self) -> bool {
        !self.relays.is_empty()
    }

    /// Whether the peer accepts direct inbound traffic
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        !self.is_firewalled() && !self.is_relayed() && !self.endpoints.is_empty()
    }

    /// Copy with the given firewall flags.
    #[must_use]
    pub fn with_firewalled(&self, tcp: bool, udp: bool) -> Self {
        Self {
            firewalled_tcp: tcp,
            firewalled_udp: udp,
            ..self.clone()
        }
    }

    /// Copy with an additional direct endpoint. Duplicates and endpoints
    /// beyond [`MAX_ENDPOINTS`] are ignored.
    #[must_use]
    pub fn with_endpoint(&self, endpoint: impl Into<PeerSocketAddress>) -> Self {
        let endpoint = endpoint.into();
        let mut next = self.clone();
        if !next.endpoints.contains(&endpoint) && next.endpoints.len() < MAX_ENDPOINTS {
            next.endpoints.push(endpoint);
        }
        next
    }

    /// Copy with `relay` appended to the relay list.
    ///
    /// Duplicates are ignored. When the list would exceed `max` entries the
    /// oldest entries are evicted first.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether_relay::peer::{PeerAddress, PeerId};
    /// use std::net::SocketAddr;
    ///
    /// let relay = |port: u16| SocketAddr::from(([10, 0, 0, 1], port));
    /// let addr = PeerAddress::new(PeerId::random(), relay(4000))
    ///     .push_relay(relay(1), 2)
    ///     .push_relay(relay(2), 2)
    ///     .push_relay(relay(3), 2);
    ///
    /// assert!(addr.is_relayed());
    /// assert_eq!(addr.relays().len(), 2);
    /// assert_eq!(addr.relays()[0].udp_port, 2);
    /// ```
    #[must_use]
    pub fn push_relay(&self, relay: impl Into<PeerSocketAddress>, max: usize) -> Self {
        let relay = relay.into();
        let mut next = self.clone();
        if next.relays.contains(&relay) {
            return next;
        }
        next.relays.push(relay);
        let limit = max.min(MAX_RELAYS);
        if next.relays.len() > limit {
            let excess = next.relays.len() - limit;
            next.relays.drain(..excess);
        }
        next
    }

    /// Copy whose relay list is exactly `relays` (subject to the same
    /// dedupe and eviction rules as [`push_relay`](Self::push_relay)).
    #[must_use]
    pub fn with_relays<I>(&self, relays: I, max: usize) -> Self
    where
        I: IntoIterator<Item = PeerSocketAddress>,
    {
        relays
            .into_iter()
            .fold(self.without_relays(), |addr, relay| addr.push_relay(relay, max))
    }

    /// Copy with an empty relay list.
    #[must_use]
    pub fn without_relays(&self) -> Self {
        Self {
            relays: Vec::new(),
            ..self.clone()
        }
    }

    /// Encoded length in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        PeerId::LEN
            + 3
            + self
                .endpoints
                .iter()
                .chain(self.relays.iter())
                .map(PeerSocketAddress::encoded_len)
                .sum::<usize>()
    }

    /// Encode the record.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Append the encoded record to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.id.as_bytes());

        let mut flags = 0u8;
        if self.firewalled_tcp {
            flags |= FLAG_FIREWALLED_TCP;
        }
        if self.firewalled_udp {
            flags |= FLAG_FIREWALLED_UDP;
        }
        if self.is_relayed() {
            flags |= FLAG_RELAYED;
        }
        out.push(flags);

        // Both lists are bounded by construction
        out.push(self.endpoints.len() as u8);
        for endpoint in &self.endpoints {
            endpoint.encode_into(out);
        }
        out.push(self.relays.len() as u8);
        for relay in &self.relays {
            relay.encode_into(out);
        }
    }

    /// Decode a record that spans all of `bytes`.
    ///
    /// # Errors
    /// Returns `WireError` on truncated input, unknown flag bits or address
    /// families, a `relayed` bit that disagrees with the relay count, oversized
    /// lists, or trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let (address, used) = Self::decode(bytes)?;
        if used != bytes.len() {
            return Err(WireError::TrailingBytes(bytes.len() - used));
        }
        Ok(address)
    }

    /// Decode one record from the front of `bytes`, returning it and the
    /// number of bytes consumed.
    ///
    /// # Errors
    /// See [`from_bytes`](Self::from_bytes).
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let mut reader = Reader { buf: bytes, pos: 0 };

        let mut id = [0u8; PeerId::LEN];
        id.copy_from_slice(reader.take(PeerId::LEN)?);

        let flags = reader.u8()?;
        if flags & !FLAG_MASK != 0 {
            return Err(WireError::UnknownFlags(flags & !FLAG_MASK));
        }

        let endpoint_count = usize::from(reader.u8()?);
        if endpoint_count > MAX_ENDPOINTS {
            return Err(WireError::TooManyEntries(endpoint_count));
        }
        let endpoints = (0..endpoint_count)
            .map(|_| PeerSocketAddress::decode_from(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;

        let relay_count = usize::from(reader.u8()?);
        if relay_count > MAX_RELAYS {
            return Err(WireError::TooManyEntries(relay_count));
        }
        if (flags & FLAG_RELAYED != 0) != (relay_count > 0) {
            return Err(WireError::RelayFlagMismatch(relay_count));
        }
        let relays = (0..relay_count)
            .map(|_| PeerSocketAddress::decode_from(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;

        let address = Self {
            id: PeerId::from_bytes(id),
            endpoints,
            firewalled_tcp: flags & FLAG_FIREWALLED_TCP != 0,
            firewalled_udp: flags & FLAG_FIREWALLED_UDP != 0,
            relays,
        };
        Ok((address, reader.pos))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id.short())?;
        if let Some(endpoint) = self.primary_endpoint() {
            write!(f, "@{endpoint}")?;
        }
        if self.is_relayed() {
            write!(f, " via {} relays", self.relays.len())?;
        }
        Ok(())
    }
}

impl Serialize for PeerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(PeerAddressVisitor)
    }
}

struct PeerAddressVisitor;

impl<'de> Visitor<'de> for PeerAddressVisitor {
    type Value = PeerAddress;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an encoded peer address record")
    }

    fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> Result<PeerAddress, E> {
        PeerAddress::from_bytes(bytes).map_err(E::custom)
    }

    fn visit_byte_buf<E: de::Error>(self, bytes: Vec<u8>) -> Result<PeerAddress, E> {
        self.visit_bytes(&bytes)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// The local peer's published address.
///
/// Holds an immutable snapshot that is swapped atomically on every change;
/// readers clone the `Arc` and never observe a partial update.
#[derive(Clone)]
pub struct PublishedAddress {
    tx: Arc<watch::Sender<Arc<PeerAddress>>>,
}

impl PublishedAddress {
    /// Start publishing `address`.
    #[must_use]
    pub fn new(address: PeerAddress) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(address));
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot
    #[must_use]
    pub fn current(&self) -> Arc<PeerAddress> {
        self.tx.borrow().clone()
    }

    /// Replace the snapshot.
    pub fn publish(&self, address: PeerAddress) {
        tracing::debug!("Publishing address {}", address);
        self.tx.send_replace(Arc::new(address));
    }

    /// Watch for future snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<PeerAddress>> {
        self.tx.subscribe()
    }
}
