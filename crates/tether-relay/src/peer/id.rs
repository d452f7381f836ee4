//! Peer identity and the XOR distance metric.

use blake3::Hasher;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 160-bit peer identifier.
///
/// Identifiers are compared by XOR distance for "closest neighbor" ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; PeerId::LEN]);

impl PeerId {
    /// Length of an identifier in bytes
    pub const LEN: usize = 20;

    /// Number of bits in an identifier
    pub const BITS: usize = Self::LEN * 8;

    /// Generate a random identifier
    ///
    /// # Examples
    ///
    /// ```
    /// use tether_relay::peer::PeerId;
    ///
    /// let id = PeerId::random();
    /// assert_ne!(id, PeerId::random());
    /// ```
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Derive an identifier by hashing arbitrary bytes
    ///
    /// BLAKE3 with domain separation, truncated to 160 bits. The same input
    /// always yields the same identifier.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether_relay::peer::PeerId;
    ///
    /// assert_eq!(PeerId::from_data(b"alice"), PeerId::from_data(b"alice"));
    /// assert_ne!(PeerId::from_data(b"alice"), PeerId::from_data(b"bob"));
    /// ```
    #[must_use]
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.update(b"tether-peer-id");
        let hash = hasher.finalize();
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..Self::LEN]);
        Self(bytes)
    }

    /// Calculate XOR distance to another identifier
    ///
    /// # Examples
    ///
    /// ```
    /// use tether_relay::peer::PeerId;
    ///
    /// let a = PeerId::from_bytes([1u8; 20]);
    /// let b = PeerId::from_bytes([2u8; 20]);
    /// assert_eq!(a.distance(&b).as_bytes()[0], 3);
    /// ```
    #[must_use]
    pub fn distance(&self, other: &PeerId) -> PeerId {
        let mut result = [0u8; Self::LEN];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        PeerId(result)
    }

    /// Order `a` and `b` by their distance to `self`.
    #[must_use]
    pub fn cmp_distance(&self, a: &PeerId, b: &PeerId) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Get the raw bytes of the identifier
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Create an identifier from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Shortened hex form for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
