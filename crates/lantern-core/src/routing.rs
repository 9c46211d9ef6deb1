//! The routing seam: advertise and discover peers under a rendezvous label.
//!
//! The routing service is an opaque collaborator. The coordinator in
//! [`crate::rendezvous`] only ever calls the three operations here; whether
//! they are backed by a registry server (`lantern-net`) or an in-process fake
//! ([`crate::mem`]) is invisible to it.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::peer::PeerAddr;

/// Errors from the routing service.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// The service could not be joined. Always fatal to the node.
    #[error("routing bootstrap failed: {0}")]
    Bootstrap(String),

    /// An advertisement could not be placed. Non-fatal; the service owns the
    /// re-advertise cadence.
    #[error("advertise failed: {0}")]
    Advertise(String),

    /// The discovery stream ended. The node cannot make progress without it.
    #[error("discovery stream ended")]
    DiscoveryStream,
}

/// Advertise-and-discover under opaque string labels.
#[async_trait]
pub trait RoutingService: Send + Sync {
    /// Join the routing service. Must complete before [`advertise`] or
    /// [`find_peers`] are useful.
    ///
    /// [`advertise`]: RoutingService::advertise
    /// [`find_peers`]: RoutingService::find_peers
    ///
    /// # Errors
    ///
    /// [`RoutingError::Bootstrap`] if the service is unreachable.
    async fn bootstrap(&self) -> Result<(), RoutingError>;

    /// Announce this node under `label`. The implementation re-advertises on
    /// its own cadence until dropped.
    ///
    /// # Errors
    ///
    /// [`RoutingError::Advertise`] if the initial announcement fails. Callers
    /// may continue; discovery does not depend on the local advertisement.
    async fn advertise(&self, label: &str) -> Result<(), RoutingError>;

    /// Subscribe to peers advertised under `label`.
    ///
    /// The stream is lazy and unbounded: peers arrive as the service learns
    /// of them, duplicates are possible, and the local node itself may
    /// appear. The channel closing means discovery has ended for good.
    async fn find_peers(&self, label: &str) -> Result<mpsc::Receiver<PeerAddr>, RoutingError>;
}
