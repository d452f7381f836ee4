//! Relay candidate selection.

use crate::peer::{PeerAddress, PeerId};
use std::collections::{HashSet, VecDeque};

/// Ordered pool of relay candidates.
///
/// Candidates are tried in the order they were offered (callers offer the
/// closest neighbors first). A candidate handed out once is remembered as
/// tried and never offered again, so a relay that failed is not retried.
#[derive(Debug, Default)]
pub struct CandidatePool {
    queue: VecDeque<PeerAddress>,
    tried: HashSet<PeerId>,
}

impl CandidatePool {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate. Returns `false` if it was rejected: already tried,
    /// already queued, or not directly reachable.
    pub fn offer(&mut self, candidate: PeerAddress) -> bool {
        let id = candidate.id();
        if !candidate.is_reachable()
            || self.tried.contains(&id)
            || self.queue.iter().any(|queued| queued.id() == id)
        {
            return false;
        }
        self.queue.push_back(candidate);
        true
    }

    /// Offer several candidates in order. Returns how many were accepted.
    pub fn offer_all<I>(&mut self, candidates: I) -> usize
    where
        I: IntoIterator<Item = PeerAddress>,
    {
        candidates
            .into_iter()
            .map(|candidate| self.offer(candidate))
            .filter(|accepted| *accepted)
            .count()
    }

    /// Hand out the next untried candidate and mark it tried.
    pub fn next(&mut self) -> Option<PeerAddress> {
        let candidate = self.queue.pop_front()?;
        self.tried.insert(candidate.id());
        Some(candidate)
    }

    /// Hand out up to `count` candidates, best first.
    pub fn take(&mut self, count: usize) -> Vec<PeerAddress> {
        std::iter::from_fn(|| self.next()).take(count).collect()
    }

    /// Remember `id` as tried, dropping it from the queue.
    pub fn mark_tried(&mut self, id: PeerId) {
        self.remove(&id);
        self.tried.insert(id);
    }

    /// Whether `id` has been handed out or marked tried
    #[must_use]
    pub fn is_tried(&self, id: &PeerId) -> bool {
        self.tried.contains(id)
    }

    /// Drop a queued candidate without marking it tried.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|queued| queued.id() != *id);
        self.queue.len() != before
    }

    /// Number of candidates still queued
    #[must_use]
    pub fn untried_count(&self) -> usize {
        self.queue.len()
    }

    /// Whether no candidate is left
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
