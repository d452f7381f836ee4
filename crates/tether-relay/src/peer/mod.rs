//! Peer identity and address records.

mod address;
mod id;

pub use address::{MAX_ENDPOINTS, MAX_RELAYS, PeerAddress, PeerSocketAddress, PublishedAddress};
pub use id::PeerId;
