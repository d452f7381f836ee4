//! # Tether Transport
//!
//! Request/response transport layer for the Tether relay overlay.
//!
//! This crate provides:
//! - The [`Transport`](transport::Transport) trait: send a request, await the
//!   response or a failure
//! - A Tokio UDP implementation with request/response framing
//! - An in-process network with NAT emulation for tests and simulation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod transport;
pub mod udp;

pub use memory::{MemoryNetwork, MemoryTransport, NatKind};
pub use transport::{RequestHandler, Transport, TransportError, TransportResult, TransportStats};
pub use udp::UdpTransport;
