//! # Lantern Net
//!
//! Network-facing implementations of the `lantern-core` boundary traits:
//!
//! - [`tcp::TcpTransportHost`] — authenticated peer streams over TCP, one
//!   connection per logical stream, gated by the network pre-shared key.
//! - [`registry::RegistryServer`] / [`registry::RegistryRouting`] — the
//!   advertise/discover service, spoken as a line protocol to the bootstrap
//!   nodes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod registry;
pub mod tcp;

pub use registry::{
    DEFAULT_ADVERTISE_INTERVAL, RegistryRouting, RegistryServer, registry_protocol,
};
pub use tcp::{TcpPeerStream, TcpTransportHost};
