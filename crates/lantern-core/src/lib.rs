//! # Lantern Core
//!
//! Discovery-and-session-establishment core for the Lantern peer-to-peer
//! chat network.
//!
//! This crate provides:
//! - Durable node identity (Ed25519 key file, BLAKE3-derived node ids)
//! - Private-network admission gating via a pre-shared key
//! - Concurrent bootstrap dialing with a join barrier
//! - Rendezvous advertise/discover over an opaque routing service
//! - Newline-framed duplex chat sessions and the bootstrap echo responder
//! - In-memory transport and routing for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Node                                  │
//! │   (bootstrap fan-out, rendezvous loop, shutdown switch)         │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │        TransportHost          │         RoutingService          │
//! │  (authenticated peer streams) │  (advertise / discover labels)  │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │                         Sessions                                │
//! │       (newline-framed duplex chat, one task per direction)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concrete network-facing implementations of the two boundary traits live
//! in `lantern-net`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bootstrap;
pub mod error;
pub mod identity;
pub mod mem;
pub mod node;
pub mod peer;
pub mod psk;
pub mod rendezvous;
pub mod routing;
pub mod session;
pub mod transport;

pub use bootstrap::{BootstrapOutcome, ConnectReport, DEFAULT_DIAL_TIMEOUT, connect_all};
pub use error::NodeError;
pub use identity::{IDENTITY_KEY_LEN, Identity, IdentityError, NodeId};
pub use node::{
    DEFAULT_BOOTSTRAP_PEERS, DEFAULT_PROTOCOL_PREFIX, DEFAULT_RENDEZVOUS_LABEL, Node, NodeConfig,
};
pub use peer::{AddrTtl, PeerAddr, PeerAddrError, PeerDirectory};
pub use psk::{GateConfig, InvalidSecret, PSK_LEN, PreSharedKey};
pub use rendezvous::{CoordinatorState, RendezvousCoordinator};
pub use routing::{RoutingError, RoutingService};
pub use session::{CHAT_PROTOCOL, MAX_FRAME, echo_once, read_frame, run_chat, write_frame};
pub use transport::{PeerStream, StreamHandler, TransportError, TransportHost};
