//! Relay Manager
//!
//! Coordinates the relay set of an unreachable peer: picks candidates from
//! the neighbor table, registers with them in parallel rounds, keeps the set
//! at its target size and publishes the resulting address.
//!
//! ```text
//!   candidates ──► round 1 (parallel setup) ──► failures replaced ──► round 2 ...
//!                                   │
//!                                   ▼
//!             active relays ──► published PeerAddress { relays, relayed }
//! ```
//!
//! The relay set lives in a watch snapshot. Outbound relaying reads it
//! without waiting for maintenance; setup and keep-alive round trips run
//! with no lock held and only swap their results into the snapshot.

use crate::config::RelayClientConfig;
use crate::error::{RelayError, RelayResult};
use crate::message::Envelope;
use crate::neighbor::NeighborTable;
use crate::peer::{PeerAddress, PeerId, PeerSocketAddress, PublishedAddress};
use crate::relay::{CandidatePool, RelayClient};
use crate::strategy::RelayStrategy;
use crate::sync::PeerMapSynchronizer;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_transport::Transport;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Result of a successful relay setup
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    /// Relay servers now serving this peer, in advertised order
    pub relays: Vec<PeerAddress>,
    /// Address published after setup
    pub address: Arc<PeerAddress>,
}

/// Counts from one reconciliation tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Failed connections removed
    pub removed: usize,
    /// Replacement connections established
    pub added: usize,
    /// Active connections after the tick
    pub active: usize,
}

impl ReconcileReport {
    /// Whether the relay set changed
    #[must_use]
    pub fn changed(&self) -> bool {
        self.removed > 0 || self.added > 0
    }
}

/// Candidate index, client and setup result of one setup task
type Setup = (usize, RelayClient, RelayResult<()>);

struct ManagerState {
    pool: CandidatePool,
    started: bool,
    last_reconcile: Option<Instant>,
}

/// Relay manager for one unreachable peer
pub struct RelayManager {
    published: PublishedAddress,
    /// Address before relaying, restored when the last relay is lost
    original: PeerAddress,
    transport: Arc<dyn Transport>,
    neighbors: Arc<dyn NeighborTable>,
    sync: Arc<PeerMapSynchronizer>,
    strategy: RelayStrategy,
    config: RelayClientConfig,
    target: usize,
    clients: watch::Sender<Vec<Arc<RelayClient>>>,
    /// Serializes start, reconcile and shutdown
    maintenance: Mutex<()>,
    state: Mutex<ManagerState>,
    shutdown: watch::Sender<bool>,
}

impl RelayManager {
    /// Create a manager publishing through `published`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidConfig` if the strategy or client
    /// configuration does not validate.
    pub fn new(
        published: PublishedAddress,
        transport: Arc<dyn Transport>,
        neighbors: Arc<dyn NeighborTable>,
        sync: Arc<PeerMapSynchronizer>,
        strategy: RelayStrategy,
        config: RelayClientConfig,
    ) -> RelayResult<Self> {
        strategy.validate()?;
        config.validate()?;

        let original = published.current().without_relays();
        let target = config.target_relay_count(&strategy);
        let (clients, _) = watch::channel(Vec::new());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            published,
            original,
            transport,
            neighbors,
            sync,
            strategy,
            config,
            target,
            clients,
            maintenance: Mutex::new(()),
            state: Mutex::new(ManagerState {
                pool: CandidatePool::new(),
                started: false,
                last_reconcile: None,
            }),
            shutdown,
        })
    }

    /// Register with up to the target number of relays and publish them.
    ///
    /// With a bootstrap address, that peer is first asked for neighbors
    /// close to the local id so candidates exist on a fresh peer.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::RelayUnavailable` if no candidate accepted, in
    /// which case the published address is unchanged, and
    /// `RelayError::Shutdown` if the manager was shut down.
    pub async fn start_relay(&self, bootstrap: Option<SocketAddr>) -> RelayResult<RelayOutcome> {
        self.ensure_running()?;
        let _maintenance = self.maintenance.lock().await;

        if let Some(addr) = bootstrap {
            if let Err(e) = self.sync.bootstrap(addr).await {
                tracing::warn!("Bootstrap via {} failed: {}", addr, e);
            }
        }

        self.refill_pool().await;
        self.fill().await?;

        let clients = self.clients.borrow().clone();
        if clients.is_empty() {
            tracing::warn!(
                "No relay available for {} ({} relay, target {})",
                self.original.id(),
                self.strategy,
                self.target
            );
            return Err(RelayError::RelayUnavailable);
        }

        self.state.lock().await.started = true;
        let address = self.publish(&clients);
        tracing::info!("Relaying through {} of {} relays", clients.len(), self.target);

        Ok(RelayOutcome {
            relays: clients.iter().map(|c| c.relay().clone()).collect(),
            address,
        })
    }

    /// One maintenance tick: keep every relay alive, drop the ones that failed,
    /// replace them from untried candidates and republish on change.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Shutdown` if the manager was shut down.
    pub async fn reconcile(&self) -> RelayResult<ReconcileReport> {
        self.ensure_running()?;
        let _maintenance = self.maintenance.lock().await;
        if !self.state.lock().await.started {
            return Ok(ReconcileReport::default());
        }

        let current = self.clients.borrow().clone();
        let mut keep_alives = JoinSet::new();
        for client in current.into_iter().filter(|c| c.is_active()) {
            keep_alives.spawn(async move { client.keep_alive().await });
        }
        while keep_alives.join_next().await.is_some() {}

        let mut failed = Vec::new();
        self.clients.send_if_modified(|clients| {
            let (live, lost): (Vec<_>, Vec<_>) =
                std::mem::take(clients).into_iter().partition(|c| c.is_active());
            *clients = live;
            failed = lost;
            !failed.is_empty()
        });
        for client in &failed {
            tracing::info!("Lost relay {}", client.relay());
            client.teardown().await;
        }

        self.refill_pool().await;
        let added = self.fill().await?;
        let clients = self.clients.borrow().clone();
        let report = ReconcileReport {
            removed: failed.len(),
            added,
            active: clients.len(),
        };

        if report.changed() {
            self.publish(&clients);
            tracing::info!(
                "Relay set changed: -{} +{}, {} active",
                report.removed,
                report.added,
                report.active
            );
        }
        self.state.lock().await.last_reconcile = Some(Instant::now());
        Ok(report)
    }

    /// Cancel in-flight setups, tear every relay down and restore the
    /// original address.
    ///
    /// Setups the relay acknowledges after this point are deregistered in
    /// the background.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let _maintenance = self.maintenance.lock().await;

        let clients = self.clients.send_replace(Vec::new());
        let mut teardowns = JoinSet::new();
        for client in clients {
            teardowns.spawn(async move { client.teardown().await });
        }
        while teardowns.join_next().await.is_some() {}

        let was_started = std::mem::replace(&mut self.state.lock().await.started, false);
        if was_started {
            self.publish(&[]);
        }
        tracing::info!("Relay manager for {} shut down", self.original.id());
    }

    /// Send `envelope` to `destination` through the first relay that
    /// delivers it.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::RelayUnavailable` if there is no active relay,
    /// otherwise the error of the last relay tried.
    pub async fn send_through_relay(
        &self,
        destination: PeerSocketAddress,
        envelope: Envelope,
    ) -> RelayResult<Envelope> {
        let mut last = RelayError::RelayUnavailable;
        for client in self.active_clients() {
            match client.send(destination, envelope.clone()).await {
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => {
                    last = RelayError::ConnectionFailed(format!(
                        "{destination} did not answer via {}",
                        client.relay_addr()
                    ));
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Active relay connections
    #[must_use]
    pub fn active_clients(&self) -> Vec<Arc<RelayClient>> {
        self.clients
            .borrow()
            .iter()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    /// Number of relay connections
    #[must_use]
    pub fn relay_count(&self) -> usize {
        self.clients.borrow().len()
    }

    /// Relay servers currently serving this peer
    #[must_use]
    pub fn relays(&self) -> Vec<PeerAddress> {
        self.clients
            .borrow()
            .iter()
            .map(|c| c.relay().clone())
            .collect()
    }

    /// When the last reconciliation finished
    pub async fn last_reconcile(&self) -> Option<Instant> {
        self.state.lock().await.last_reconcile
    }

    /// Target relay-set size
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.target
    }

    /// Relay strategy
    #[must_use]
    pub fn strategy(&self) -> RelayStrategy {
        self.strategy
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn ensure_running(&self) -> RelayResult<()> {
        if self.is_shut_down() {
            Err(RelayError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Offer reachable neighbors, closest first, that are not already relays.
    async fn refill_pool(&self) {
        let local = self.original.id();
        let active: HashSet<PeerId> = self.clients.borrow().iter().map(|c| c.relay_id()).collect();
        let candidates: Vec<_> = self
            .neighbors
            .closest(&local, usize::MAX)
            .into_iter()
            .filter(|candidate| candidate.id() != local && !active.contains(&candidate.id()))
            .collect();
        let offered = self.state.lock().await.pool.offer_all(candidates);
        if offered > 0 {
            tracing::trace!("Offered {} new relay candidates", offered);
        }
    }

    /// Run parallel setup rounds until the target is met or candidates run
    /// out. Returns the number of connections added.
    async fn fill(&self) -> RelayResult<usize> {
        let mut shutdown = self.shutdown.subscribe();
        let mut added = 0;

        loop {
            self.ensure_running()?;
            let needed = self.target.saturating_sub(self.relay_count());
            let round = self.state.lock().await.pool.take(needed);
            if round.is_empty() {
                break;
            }
            tracing::debug!("Trying {} relay candidates", round.len());

            let mut setups = JoinSet::new();
            for (index, candidate) in round.into_iter().enumerate() {
                let mut client = match RelayClient::new(
                    candidate,
                    self.published.clone(),
                    self.transport.clone(),
                    self.strategy,
                    self.config.clone(),
                ) {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::debug!("Skipping relay candidate: {}", e);
                        continue;
                    }
                };
                setups.spawn(async move {
                    let result = client.setup().await;
                    (index, client, result)
                });
            }

            let mut results: Vec<Setup> = Vec::new();
            loop {
                tokio::select! {
                    joined = setups.join_next() => match joined {
                        Some(Ok(entry)) => results.push(entry),
                        Some(Err(e)) => tracing::warn!("Relay setup task failed: {}", e),
                        None => break,
                    },
                    _ = shutdown.wait_for(|stop| *stop) => {
                        tracing::debug!("Relay setup cancelled by shutdown");
                        withdraw(setups, results);
                        return Err(RelayError::Shutdown);
                    }
                }
            }

            // Keep candidate order so the closest relays are advertised first
            results.sort_by_key(|(index, _, _)| *index);
            let mut fresh = Vec::new();
            for (_, client, result) in results {
                match result {
                    Ok(()) => fresh.push(Arc::new(client)),
                    Err(e) => tracing::debug!("Relay candidate {} failed: {}", client.relay(), e),
                }
            }
            if fresh.is_empty() {
                continue;
            }
            if self.is_shut_down() {
                for client in fresh {
                    client.teardown().await;
                }
                return Err(RelayError::Shutdown);
            }
            added += fresh.len();
            self.clients.send_modify(|clients| clients.extend(fresh));
        }
        Ok(added)
    }

    /// Publish the address matching `clients`.
    fn publish(&self, clients: &[Arc<RelayClient>]) -> Arc<PeerAddress> {
        let address = if clients.is_empty() {
            self.original.clone()
        } else {
            self.original
                .with_firewalled(false, false)
                .with_relays(clients.iter().map(|c| c.relay_socket()), self.target)
        };
        self.published.publish(address);
        self.published.current()
    }
}

/// Deregister from relays whose setup completes after shutdown began. The
/// relay may have registered us even though nobody waits for its answer.
fn withdraw(mut setups: JoinSet<Setup>, finished: Vec<Setup>) {
    tokio::spawn(async move {
        for (_, client, result) in finished {
            if result.is_ok() {
                client.teardown().await;
            }
        }
        while let Some(joined) = setups.join_next().await {
            if let Ok((_, client, Ok(()))) = joined {
                tracing::debug!("Withdrawing late registration with {}", client.relay());
                client.teardown().await;
            }
        }
    });
}
