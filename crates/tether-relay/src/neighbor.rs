//! Neighbor table abstraction and an in-memory implementation.
//!
//! The relay layer only needs a handful of operations from the overlay's
//! routing table: classify a freshly seen peer, promote it once it proves
//! routable, enumerate, and look up the closest neighbors. [`PeerMap`] keeps
//! two bags, *verified* (routable) and *overflow* (seen but unverified).

use crate::peer::{PeerAddress, PeerId};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default capacity of the overflow bag
pub const DEFAULT_OVERFLOW_CAPACITY: usize = 256;

/// Where a neighbor record lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Routable
    Verified,
    /// Seen but not yet routable, e.g. firewalled or freshly relayed
    Overflow,
}

/// Operations the relay layer uses on the overlay's neighbor table
pub trait NeighborTable: Send + Sync {
    /// Bag a record would be placed in if inserted now
    fn classify(&self, address: &PeerAddress) -> Classification;

    /// Insert or refresh a record. Returns where it ended up, or `None` if
    /// the record was rejected (e.g. the local peer itself).
    fn insert(&self, address: PeerAddress) -> Option<Classification>;

    /// Move an overflow record to the verified bag. Returns whether a
    /// record was moved.
    fn promote(&self, id: &PeerId) -> bool;

    /// Remove a record from either bag.
    fn remove(&self, id: &PeerId) -> bool;

    /// Look up a record in either bag.
    fn get(&self, id: &PeerId) -> Option<PeerAddress>;

    /// All verified records
    fn all(&self) -> Vec<PeerAddress>;

    /// All overflow records, oldest first
    fn all_overflow(&self) -> Vec<PeerAddress>;

    /// Up to `n` verified records closest to `target`, closest first
    fn closest(&self, target: &PeerId, n: usize) -> Vec<PeerAddress>;
}

/// In-memory neighbor table
pub struct PeerMap {
    local: PeerId,
    verified: DashMap<PeerId, PeerAddress>,
    overflow: Mutex<VecDeque<PeerAddress>>,
    overflow_capacity: usize,
}

impl PeerMap {
    /// Create an empty table for the peer `local`.
    #[must_use]
    pub fn new(local: PeerId) -> Self {
        Self::with_capacity(local, DEFAULT_OVERFLOW_CAPACITY)
    }

    /// Create an empty table with a custom overflow capacity.
    #[must_use]
    pub fn with_capacity(local: PeerId, overflow_capacity: usize) -> Self {
        Self {
            local,
            verified: DashMap::new(),
            overflow: Mutex::new(VecDeque::new()),
            overflow_capacity: overflow_capacity.max(1),
        }
    }

    /// Number of verified records
    #[must_use]
    pub fn verified_count(&self) -> usize {
        self.verified.len()
    }

    /// Number of overflow records
    #[must_use]
    pub fn overflow_count(&self) -> usize {
        self.overflow().len()
    }

    /// Whether `id` is in the verified bag
    #[must_use]
    pub fn is_verified(&self, id: &PeerId) -> bool {
        self.verified.contains_key(id)
    }

    fn overflow(&self) -> std::sync::MutexGuard<'_, VecDeque<PeerAddress>> {
        self.overflow
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl NeighborTable for PeerMap {
    fn classify(&self, address: &PeerAddress) -> Classification {
        if self.verified.contains_key(&address.id()) || address.is_reachable() {
            Classification::Verified
        } else {
            Classification::Overflow
        }
    }

    fn insert(&self, address: PeerAddress) -> Option<Classification> {
        let id = address.id();
        if id == self.local {
            return None;
        }

        if let Some(mut entry) = self.verified.get_mut(&id) {
            *entry = address;
            return Some(Classification::Verified);
        }

        let mut overflow = self.overflow();
        if address.is_reachable() {
            overflow.retain(|entry| entry.id() != id);
            drop(overflow);
            tracing::trace!("Neighbor {} verified", address);
            self.verified.insert(id, address);
            return Some(Classification::Verified);
        }

        match overflow.iter_mut().find(|entry| entry.id() == id) {
            Some(entry) => *entry = address,
            None => {
                tracing::trace!("Neighbor {} added to overflow", address);
                overflow.push_back(address);
                while overflow.len() > self.overflow_capacity {
                    overflow.pop_front();
                }
            }
        }
        Some(Classification::Overflow)
    }

    fn promote(&self, id: &PeerId) -> bool {
        let mut overflow = self.overflow();
        let Some(position) = overflow.iter().position(|entry| entry.id() == *id) else {
            return false;
        };
        let Some(address) = overflow.remove(position) else {
            return false;
        };
        drop(overflow);

        tracing::debug!("Promoted neighbor {} to verified", address);
        self.verified.insert(*id, address);
        true
    }

    fn remove(&self, id: &PeerId) -> bool {
        if self.verified.remove(id).is_some() {
            return true;
        }
        let mut overflow = self.overflow();
        let before = overflow.len();
        overflow.retain(|entry| entry.id() != *id);
        overflow.len() != before
    }

    fn get(&self, id: &PeerId) -> Option<PeerAddress> {
        if let Some(entry) = self.verified.get(id) {
            return Some(entry.value().clone());
        }
        self.overflow()
            .iter()
            .find(|entry| entry.id() == *id)
            .cloned()
    }

    fn all(&self) -> Vec<PeerAddress> {
        self.verified
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn all_overflow(&self) -> Vec<PeerAddress> {
        self.overflow().iter().cloned().collect()
    }

    fn closest(&self, target: &PeerId, n: usize) -> Vec<PeerAddress> {
        let mut all = self.all();
        all.sort_by(|a, b| target.cmp_distance(&a.id(), &b.id()));
        all.truncate(n);
        all
    }
}
