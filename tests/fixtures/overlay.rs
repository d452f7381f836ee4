//! In-memory overlay fixture
//!
//! Spawns reachable peers, relay peers and unreachable peers on one
//! [`MemoryNetwork`]. Unreachable peers sit behind a restricted NAT, so
//! inbound traffic only reaches them through their relays.
//!
//! # Example
//!
//! ```no_run
//! use tether_integration_tests::fixtures::Overlay;
//! use tether_relay::{RelayClientConfig, RelayServerConfig, RelayStrategy};
//!
//! # async fn example() {
//! let overlay = Overlay::new();
//! let relay = overlay.relay(RelayServerConfig::default());
//! let hidden = overlay.unreachable();
//!
//! hidden
//!     .start_relay(
//!         RelayStrategy::Unbuffered,
//!         RelayClientConfig::default(),
//!         Some(relay.local_addr().unwrap()),
//!     )
//!     .await
//!     .unwrap();
//! # }
//! ```

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_relay::{MessageHandler, Peer, PeerAddress, PeerConfig, PeerId, RelayServerConfig};
use tether_transport::{MemoryNetwork, NatKind};
use tokio::time::Instant;

/// Application handler recording every payload with its arrival time
#[derive(Default)]
pub struct Recorder {
    received: Mutex<Vec<(Instant, PeerId, Vec<u8>)>>,
}

impl Recorder {
    /// Payloads received so far with arrival time and sender
    pub fn received(&self) -> Vec<(Instant, PeerId, Vec<u8>)> {
        self.received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, sender: &PeerAddress, payload: Vec<u8>) -> Vec<u8> {
        self.received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((Instant::now(), sender.id(), payload.clone()));

        let mut reply = b"echo:".to_vec();
        reply.extend_from_slice(&payload);
        reply
    }
}

/// A set of peers on one in-memory network
pub struct Overlay {
    /// The shared network
    pub network: MemoryNetwork,
    interval: Duration,
}

impl Default for Overlay {
    fn default() -> Self {
        Self::new()
    }
}

impl Overlay {
    /// Create an empty overlay with the default maintenance interval
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            interval: PeerConfig::default().peer_map_update_interval,
        }
    }

    /// Use `interval` as the maintenance interval of peers spawned later
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Maintenance interval of spawned peers
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn a peer with `config` behind `nat`.
    ///
    /// # Panics
    ///
    /// Panics if the configuration does not validate.
    pub fn spawn(&self, config: PeerConfig, nat: NatKind, handler: Option<Arc<Recorder>>) -> Peer {
        let config = PeerConfig {
            peer_map_update_interval: self.interval,
            ..config
        };
        let handler = handler.map(|recorder| recorder as Arc<dyn MessageHandler>);
        Peer::start(config, Arc::new(self.network.attach_new(nat)), handler)
            .expect("peer configuration is valid")
    }

    /// Spawn a reachable peer that relays for others
    pub fn relay(&self, server: RelayServerConfig) -> Peer {
        self.spawn(PeerConfig::relay(server), NatKind::Open, None)
    }

    /// Spawn a reachable peer without relay service
    pub fn reachable(&self) -> Peer {
        self.spawn(PeerConfig::default(), NatKind::Open, None)
    }

    /// Spawn an unreachable peer behind a restricted NAT
    pub fn unreachable(&self) -> Peer {
        self.spawn(PeerConfig::unreachable(), NatKind::Restricted, None)
    }

    /// Spawn an unreachable peer whose application requests go to `recorder`
    pub fn unreachable_with(&self, recorder: Arc<Recorder>) -> Peer {
        self.spawn(PeerConfig::unreachable(), NatKind::Restricted, Some(recorder))
    }

    /// Take `peer` off the network; its requests and inbound traffic fail.
    pub fn take_offline(&self, peer: &Peer) {
        if let Ok(addr) = peer.local_addr() {
            self.network.set_online(addr, false);
        }
    }
}
