//! Peer-map synchronization.
//!
//! Periodic work that keeps other peers' view of this peer current: the
//! verified-neighbor snapshot is mirrored on every active relay, the current
//! address is announced to verified neighbors, and relayed peers sitting in
//! the overflow bag are promoted once their relay set is observed.

use crate::error::{RelayError, RelayResult};
use crate::message::{Body, Envelope};
use crate::neighbor::NeighborTable;
use crate::peer::{PeerAddress, PublishedAddress};
use crate::relay::{RelayClient, round_trip};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_transport::Transport;
use tokio::task::JoinSet;

/// Outcome of one announcement round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceReport {
    /// Neighbors that answered
    pub reached: usize,
    /// Neighbors that did not
    pub failed: usize,
}

/// Peer-map synchronizer
pub struct PeerMapSynchronizer {
    published: PublishedAddress,
    transport: Arc<dyn Transport>,
    neighbors: Arc<dyn NeighborTable>,
    request_timeout: Duration,
}

impl PeerMapSynchronizer {
    /// Create a synchronizer for the local peer.
    #[must_use]
    pub fn new(
        published: PublishedAddress,
        transport: Arc<dyn Transport>,
        neighbors: Arc<dyn NeighborTable>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            published,
            transport,
            neighbors,
            request_timeout,
        }
    }

    /// Push the verified-neighbor snapshot to every active relay. Returns the
    /// number of relays that acknowledged. A relay that does not is left
    /// `Failed` for the next reconciliation.
    pub async fn push_peer_map(&self, clients: &[Arc<RelayClient>]) -> usize {
        let snapshot = self.neighbors.all();
        let mut set = JoinSet::new();
        for client in clients.iter().filter(|client| client.is_active()) {
            let client = client.clone();
            let snapshot = snapshot.clone();
            set.spawn(async move { client.sync_peer_map(snapshot).await.is_ok() });
        }

        let mut pushed = 0;
        while let Some(result) = set.join_next().await {
            if matches!(result, Ok(true)) {
                pushed += 1;
            }
        }
        tracing::trace!("Pushed {} neighbors to {} relays", snapshot.len(), pushed);
        pushed
    }

    /// Announce the current address to every reachable verified neighbor.
    pub async fn announce(&self) -> AnnounceReport {
        let local = self.published.current();
        let mut set = JoinSet::new();

        for neighbor in self.neighbors.all() {
            let Some(endpoint) = neighbor.primary_endpoint().filter(|_| neighbor.is_reachable()) else {
                continue;
            };
            let transport = self.transport.clone();
            let request = Envelope::new(local.as_ref().clone(), Some(neighbor.id()), Body::Ping);
            let timeout = self.request_timeout;
            set.spawn(async move {
                let result = round_trip(transport.as_ref(), endpoint.udp_addr(), &request, timeout).await;
                (neighbor, result)
            });
        }

        let mut report = AnnounceReport::default();
        while let Some(joined) = set.join_next().await {
            let Ok((neighbor, result)) = joined else {
                report.failed += 1;
                continue;
            };
            match result {
                Ok(reply) if reply.sender.id() == neighbor.id() && reply.body == Body::Pong => {
                    self.neighbors.insert(reply.sender);
                    report.reached += 1;
                }
                Ok(_) => report.failed += 1,
                Err(e) => {
                    tracing::trace!("Announcement to {} failed: {}", neighbor, e);
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            "Announced {} to {} neighbors ({} failed)",
            local,
            report.reached,
            report.failed
        );
        report
    }

    /// Promote overflow entries that advertise relays. Returns how many were
    /// promoted.
    pub fn promote_relayed(&self) -> usize {
        let promoted = self
            .neighbors
            .all_overflow()
            .into_iter()
            .filter(PeerAddress::is_relayed)
            .filter(|address| self.neighbors.promote(&address.id()))
            .count();
        if promoted > 0 {
            tracing::debug!("Promoted {} relayed neighbors", promoted);
        }
        promoted
    }

    /// Ask the peer at `addr` for neighbors close to the local id and insert
    /// the answer, the answering peer included. Returns the number of records
    /// inserted.
    ///
    /// # Errors
    ///
    /// Returns a transport or codec error if the query fails, and
    /// `RelayError::UnexpectedReply` if the answer is not a neighbor reply.
    pub async fn bootstrap(&self, addr: SocketAddr) -> RelayResult<usize> {
        let local = self.published.current();
        let request = Envelope::new(
            local.as_ref().clone(),
            None,
            Body::NeighborQuery { target: local.id() },
        );

        let reply = round_trip(self.transport.as_ref(), addr, &request, self.request_timeout).await?;
        let Body::NeighborReply { neighbors } = reply.body else {
            return Err(RelayError::UnexpectedReply(reply.body.name()));
        };

        let inserted = std::iter::once(reply.sender)
            .chain(neighbors)
            .filter_map(|neighbor| self.neighbors.insert(neighbor))
            .count();
        tracing::debug!("Bootstrap via {} learned {} neighbors", addr, inserted);
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbor::PeerMap;
    use crate::peer::PeerId;
    use async_trait::async_trait;
    use tether_transport::{MemoryNetwork, NatKind, RequestHandler};

    /// Reachable peer answering pings and neighbor queries
    struct Responder {
        address: PeerAddress,
        known: Vec<PeerAddress>,
    }

    #[async_trait]
    impl RequestHandler for Responder {
        async fn handle(&self, _from: SocketAddr, request: Vec<u8>) -> Option<Vec<u8>> {
            let request = Envelope::from_bytes(&request).ok()?;
            let body = match request.body {
                Body::Ping => Body::Pong,
                Body::NeighborQuery { .. } => Body::NeighborReply {
                    neighbors: self.known.clone(),
                },
                _ => Body::Ack,
            };
            request.reply(self.address.clone(), body).to_bytes().ok()
        }
    }

    fn responder(network: &MemoryNetwork, known: Vec<PeerAddress>) -> Arc<Responder> {
        let transport = network.attach_new(NatKind::Open);
        let responder = Arc::new(Responder {
            address: PeerAddress::new(PeerId::random(), transport.local_addr().unwrap()),
            known,
        });
        let handler: Arc<dyn RequestHandler> = responder.clone();
        transport.serve(Arc::downgrade(&handler));
        responder
    }

    fn synchronizer(network: &MemoryNetwork) -> (PeerMapSynchronizer, Arc<PeerMap>) {
        let transport = network.attach_new(NatKind::Restricted);
        let local = PeerAddress::new(PeerId::random(), transport.local_addr().unwrap())
            .with_firewalled(true, true);
        let table = Arc::new(PeerMap::new(local.id()));
        let sync = PeerMapSynchronizer::new(
            PublishedAddress::new(local),
            Arc::new(transport),
            table.clone(),
            Duration::from_secs(1),
        );
        (sync, table)
    }

    #[tokio::test]
    async fn test_bootstrap_inserts_answer() {
        let network = MemoryNetwork::new();
        let known = vec![
            PeerAddress::new(PeerId::random(), SocketAddr::from(([10, 3, 0, 1], 4000))),
            PeerAddress::new(PeerId::random(), SocketAddr::from(([10, 3, 0, 2], 4000)))
                .with_firewalled(true, true),
        ];
        let seed = responder(&network, known);
        let (sync, table) = synchronizer(&network);

        let seed_addr = seed.address.primary_endpoint().unwrap().udp_addr();
        assert_eq!(sync.bootstrap(seed_addr).await.unwrap(), 3);
        assert_eq!(table.verified_count(), 2);
        assert_eq!(table.overflow_count(), 1);
        assert!(table.is_verified(&seed.address.id()));
    }

    #[tokio::test]
    async fn test_bootstrap_unreachable_seed() {
        let network = MemoryNetwork::new();
        let (sync, table) = synchronizer(&network);

        let result = sync.bootstrap(SocketAddr::from(([10, 99, 0, 1], 4000))).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
        assert!(table.all().is_empty());
    }

    #[tokio::test]
    async fn test_announce_reaches_verified_neighbors() {
        let network = MemoryNetwork::new();
        let a = responder(&network, Vec::new());
        let b = responder(&network, Vec::new());
        let (sync, table) = synchronizer(&network);

        table.insert(a.address.clone());
        table.insert(b.address.clone());
        table.insert(PeerAddress::new(
            PeerId::random(),
            SocketAddr::from(([10, 98, 0, 1], 4000)),
        ));

        let report = sync.announce().await;
        assert_eq!(
            report,
            AnnounceReport {
                reached: 2,
                failed: 1
            }
        );
    }

    #[test]
    fn test_promote_relayed_only() {
        let local = PeerId::random();
        let table = Arc::new(PeerMap::new(local));
        let network = MemoryNetwork::new();
        let sync = PeerMapSynchronizer::new(
            PublishedAddress::new(PeerAddress::without_endpoint(local)),
            Arc::new(network.attach_new(NatKind::Open)),
            table.clone(),
            Duration::from_secs(1),
        );

        let endpoint = SocketAddr::from(([10, 4, 0, 1], 4000));
        let firewalled = PeerAddress::new(PeerId::random(), endpoint).with_firewalled(true, true);
        let relayed = PeerAddress::new(PeerId::random(), endpoint)
            .with_firewalled(true, true)
            .push_relay(SocketAddr::from(([10, 4, 0, 2], 4000)), 2);
        table.insert(firewalled.clone());
        table.insert(relayed.clone());

        assert_eq!(sync.promote_relayed(), 1);
        assert!(table.is_verified(&relayed.id()));
        assert!(!table.is_verified(&firewalled.id()));
        assert_eq!(sync.promote_relayed(), 0);
    }
}
