//! Rendezvous coordinator: advertise under a label, discover peers under the
//! same label, and open a session to each new peer.
//!
//! The coordinator is a single sequential loop. Discovery failures for one
//! peer never affect another; only losing the discovery stream itself ends
//! the loop with an error.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::peer::AddrTtl;
use crate::routing::{RoutingError, RoutingService};
use crate::transport::{StreamHandler, TransportHost};

/// Observable lifecycle of the coordinator, in the order states are entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Not yet run.
    Idle,
    /// The routing service has been joined.
    RoutingBootstrapped,
    /// The local advertisement has been placed.
    Advertised,
    /// Discovery results are flowing.
    Discovering,
    /// At least one session has been established.
    SteadyState,
}

/// Drives advertise, discover, and session establishment for one label.
pub struct RendezvousCoordinator {
    host: Arc<dyn TransportHost>,
    routing: Arc<dyn RoutingService>,
    label: String,
    protocol: String,
    on_session: StreamHandler,
    state: watch::Sender<CoordinatorState>,
}

impl RendezvousCoordinator {
    /// Create a coordinator that opens `protocol` streams to peers found
    /// under `label`, handing each established stream to `on_session`.
    #[must_use]
    pub fn new(
        host: Arc<dyn TransportHost>,
        routing: Arc<dyn RoutingService>,
        label: impl Into<String>,
        protocol: impl Into<String>,
        on_session: StreamHandler,
    ) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Idle);
        Self {
            host,
            routing,
            label: label.into(),
            protocol: protocol.into(),
            on_session,
            state,
        }
    }

    /// Subscribe to the coordinator's lifecycle state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    fn enter(&self, state: CoordinatorState) {
        debug!(?state, "coordinator state change");
        let _ = self.state.send(state);
    }

    /// Run until `shutdown` fires or the discovery stream is lost.
    ///
    /// # Errors
    ///
    /// [`RoutingError::Bootstrap`] if the routing service cannot be joined;
    /// [`RoutingError::DiscoveryStream`] if the peer stream closes. A failed
    /// advertisement is logged and tolerated, since the node can still find
    /// peers that advertised successfully.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RoutingError> {
        self.routing.bootstrap().await?;
        self.enter(CoordinatorState::RoutingBootstrapped);

        match self.routing.advertise(&self.label).await {
            Ok(()) => {
                info!(label = %self.label, "advertised rendezvous point");
                self.enter(CoordinatorState::Advertised);
            }
            Err(e) => warn!(label = %self.label, error = %e, "advertise failed, continuing"),
        }

        let mut peers = self.routing.find_peers(&self.label).await?;
        self.enter(CoordinatorState::Discovering);
        info!(label = %self.label, "searching for peers");

        loop {
            let peer = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                peer = peers.recv() => match peer {
                    Some(peer) => peer,
                    None => return Err(RoutingError::DiscoveryStream),
                },
            };

            if peer.id == self.host.local_id() {
                continue;
            }
            debug!(peer = %peer.id, "peer discovered");
            self.host.directory().insert(&peer, AddrTtl::Ephemeral);

            match self.host.open_stream(&peer.id, &self.protocol).await {
                Ok(stream) => {
                    info!(peer = %peer.id, "session established");
                    (self.on_session)(peer.id, stream);
                    self.enter(CoordinatorState::SteadyState);
                }
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "session establishment failed");
                }
            }
        }
    }
}
