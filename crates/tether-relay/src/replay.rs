//! Answers to recently handled application requests.
//!
//! A relayed request can reach its destination more than once: a sender that
//! gives up on one relay retries the same envelope through the next, while the
//! first relay may still deliver its buffered copy. Requests are keyed by
//! sender and envelope id; a repeat waits for or reuses the first answer and
//! never reaches the application handler again.

use crate::message::Envelope;
use crate::peer::PeerId;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;

/// Number of answers remembered by default
pub const DEFAULT_REPLAY_CAPACITY: usize = 1024;

type Key = (PeerId, u64);

#[derive(Default)]
struct Slots {
    order: VecDeque<Key>,
    answers: HashMap<Key, Arc<OnceCell<Envelope>>>,
}

/// Bounded cache of answered requests, oldest forgotten first
pub struct ReplayCache {
    capacity: usize,
    slots: Mutex<Slots>,
}

impl ReplayCache {
    /// Create a cache remembering up to `capacity` answers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Answer request `id` from `sender` once.
    ///
    /// The first caller runs `answer`; concurrent and later callers with the
    /// same key get a clone of its result.
    pub async fn answer_once<F, Fut>(&self, sender: PeerId, id: u64, answer: F) -> Envelope
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Envelope>,
    {
        let slot = self.slot((sender, id));
        if slot.initialized() {
            tracing::debug!("Repeated request {:016x} from {}, reusing answer", id, sender);
        }
        slot.get_or_init(answer).await.clone()
    }

    /// Number of remembered requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots().answers.len()
    }

    /// Whether nothing is remembered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, key: Key) -> Arc<OnceCell<Envelope>> {
        let mut slots = self.slots();
        if let Some(slot) = slots.answers.get(&key) {
            return slot.clone();
        }

        while slots.order.len() >= self.capacity {
            match slots.order.pop_front() {
                Some(oldest) => {
                    slots.answers.remove(&oldest);
                }
                None => break,
            }
        }
        let slot = Arc::new(OnceCell::new());
        slots.order.push_back(key);
        slots.answers.insert(key, slot.clone());
        slot
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Body;
    use crate::peer::PeerAddress;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn request(n: u8) -> Envelope {
        let sender = PeerAddress::new(PeerId::from_data(&[n]), SocketAddr::from(([10, 9, 0, n], 4000)));
        Envelope::new(sender, None, Body::Ping)
    }

    async fn pong(calls: &AtomicUsize, request: &Envelope) -> Envelope {
        calls.fetch_add(1, Ordering::SeqCst);
        request.reply(request.sender.clone(), Body::Pong)
    }

    #[tokio::test]
    async fn test_repeat_reuses_first_answer() {
        let cache = ReplayCache::default();
        let calls = AtomicUsize::new(0);
        let req = request(1);

        let first = cache
            .answer_once(req.sender.id(), req.id, || pong(&calls, &req))
            .await;
        let second = cache
            .answer_once(req.sender.id(), req.id, || pong(&calls, &req))
            .await;

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_repeat_waits_for_answer() {
        let cache = ReplayCache::default();
        let calls = AtomicUsize::new(0);
        let req = request(2);
        let (calls_ref, req_ref) = (&calls, &req);
        let slow = move || async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            pong(calls_ref, req_ref).await
        };

        let (a, b) = tokio::join!(
            cache.answer_once(req.sender.id(), req.id, slow),
            cache.answer_once(req.sender.id(), req.id, slow)
        );
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_id_from_other_sender_is_distinct() {
        let cache = ReplayCache::default();
        let calls = AtomicUsize::new(0);
        let a = request(3);
        let mut b = request(4);
        b.id = a.id;

        cache.answer_once(a.sender.id(), a.id, || pong(&calls, &a)).await;
        cache.answer_once(b.sender.id(), b.id, || pong(&calls, &b)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_capacity_forgets_oldest() {
        let cache = ReplayCache::new(2);
        let calls = AtomicUsize::new(0);
        let requests: Vec<Envelope> = (5..8).map(request).collect();

        for req in &requests {
            cache.answer_once(req.sender.id(), req.id, || pong(&calls, req)).await;
        }
        assert_eq!(cache.len(), 2);

        let oldest = &requests[0];
        cache
            .answer_once(oldest.sender.id(), oldest.id, || pong(&calls, oldest))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
