//! # Tether Relay
//!
//! NAT-traversal relay layer for the Tether peer-to-peer overlay.
//!
//! A peer that cannot accept inbound traffic registers with a few reachable
//! peers that relay for it, advertises those relays inside its address
//! record, and stays addressable: senders try the direct endpoint first and
//! fall back to the advertised relays.
//!
//! This crate provides:
//! - Peer identities and the wire-stable [`PeerAddress`] record
//! - Relay strategies, unbuffered or buffered with age/count/byte limits
//! - A message buffer draining on whichever limit trips first
//! - Relay client and server, and the manager keeping the relay set full
//! - Peer-map mirroring on relays and overflow promotion of relayed peers
//! - The direct/relay [`Dispatcher`] and a [`Peer`] node wiring it together
//! - A replay cache answering repeated relayed requests once
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use tether_relay::{Peer, PeerConfig, RelayClientConfig, RelayStrategy};
//! use tether_transport::UdpTransport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bind: SocketAddr = "0.0.0.0:0".parse()?;
//! let transport = UdpTransport::bind(bind).await?;
//! let peer = Peer::start(PeerConfig::unreachable(), Arc::new(transport), None)?;
//!
//! let outcome = peer
//!     .start_relay(
//!         RelayStrategy::Unbuffered,
//!         RelayClientConfig::default(),
//!         Some("203.0.113.7:4000".parse()?),
//!     )
//!     .await?;
//! println!("Relayed through {} peers as {}", outcome.relays.len(), outcome.address);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod message;
pub mod neighbor;
pub mod node;
pub mod peer;
pub mod relay;
pub mod replay;
pub mod strategy;
pub mod sync;

// Re-export commonly used types
pub use config::{PeerConfig, RelayClientConfig, RelayServerConfig, Settings};
pub use dispatch::{Delivery, DispatchOutcome, Dispatcher};
pub use error::{DispatchError, RelayError, RelayResult, WireError};
pub use manager::{ReconcileReport, RelayManager, RelayOutcome};
pub use message::{Body, Envelope, ErrorCode};
pub use neighbor::{Classification, NeighborTable, PeerMap};
pub use node::{MessageHandler, Peer};
pub use peer::{PeerAddress, PeerId, PeerSocketAddress, PublishedAddress};
pub use relay::{RelayClient, RelayConnectionState, RelayServer};
pub use replay::ReplayCache;
pub use strategy::{BufferLimits, RelayKind, RelayStrategy};
pub use sync::{AnnounceReport, PeerMapSynchronizer};
