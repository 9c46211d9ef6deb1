//! Node orchestrator: ties identity, transport, bootstrap, and rendezvous
//! into one run loop with a single shutdown switch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::bootstrap::{self, DEFAULT_DIAL_TIMEOUT};
use crate::error::NodeError;
use crate::peer::PeerAddr;
use crate::rendezvous::{CoordinatorState, RendezvousCoordinator};
use crate::routing::RoutingService;
use crate::session::CHAT_PROTOCOL;
use crate::transport::{StreamHandler, TransportHost};

/// Well-known seed nodes dialed when no `--bootstrap` override is given.
///
/// Parsed at node construction; a malformed entry here is a configuration
/// error, never silently skipped.
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] = &[
    "/ip4/147.75.83.83/tcp/7654/p2p/9d2f64f92063a9a0cfcb44e1ff6ae9ffdff0f5c73469e485e0e17b4b0c218cd7",
    "/ip4/147.75.77.187/tcp/7654/p2p/3c1f5fd2b0d13e7a28c873bee9b0895e45a0956c89fa121d0cc0c2c2ea31e1da",
    "/ip4/136.144.57.15/tcp/7654/p2p/b8f4ae17dbcb39b9a8ee7c6a1f47535c6d8e5f209de413a193b8be471b6d5ba6",
];

/// Default rendezvous label when the operator does not pick one.
pub const DEFAULT_RENDEZVOUS_LABEL: &str = "meet-me-here";

/// Default protocol namespace for the routing service.
pub const DEFAULT_PROTOCOL_PREFIX: &str = "/lantern";

/// Everything needed to start a node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// TCP listen port. Zero asks the OS for one.
    pub listen_port: u16,
    /// Path of the identity key file.
    pub identity_path: PathBuf,
    /// Hex pre-shared key for a private overlay, absent for the open network.
    pub psk: Option<String>,
    /// Label to advertise and discover under.
    pub rendezvous_label: String,
    /// Protocol namespace for the routing service.
    pub protocol_prefix: String,
    /// Seed peers in `/ip4/…/tcp/…/p2p/…` form.
    pub bootstrap: Vec<String>,
    /// Per-seed dial deadline.
    pub dial_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            identity_path: PathBuf::from("lantern.key"),
            psk: None,
            rendezvous_label: DEFAULT_RENDEZVOUS_LABEL.to_string(),
            protocol_prefix: DEFAULT_PROTOCOL_PREFIX.to_string(),
            bootstrap: DEFAULT_BOOTSTRAP_PEERS.iter().map(|s| (*s).to_string()).collect(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

impl NodeConfig {
    /// Parse the configured seed list.
    ///
    /// # Errors
    ///
    /// [`NodeError::Config`] on the first malformed entry.
    pub fn parse_bootstrap(&self) -> Result<Vec<PeerAddr>, NodeError> {
        self.bootstrap
            .iter()
            .map(|s| s.parse().map_err(|e| NodeError::Config(format!("{e}"))))
            .collect()
    }
}

/// A running peer node.
///
/// The caller supplies the transport host and routing service; the node owns
/// bootstrap fan-out, the rendezvous coordinator, and the shutdown switch
/// that unwinds both.
pub struct Node {
    host: Arc<dyn TransportHost>,
    coordinator: RendezvousCoordinator,
    seeds: Vec<PeerAddr>,
    dial_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Assemble a node. `on_session` receives each chat stream the
    /// coordinator establishes; inbound streams reach the handler the caller
    /// registered on the host directly.
    ///
    /// # Errors
    ///
    /// [`NodeError::Config`] if the seed list does not parse.
    pub fn new(
        host: Arc<dyn TransportHost>,
        routing: Arc<dyn RoutingService>,
        config: &NodeConfig,
        on_session: StreamHandler,
    ) -> Result<Self, NodeError> {
        let seeds = config.parse_bootstrap()?;
        let coordinator = RendezvousCoordinator::new(
            Arc::clone(&host),
            routing,
            config.rendezvous_label.clone(),
            CHAT_PROTOCOL,
            on_session,
        );
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            host,
            coordinator,
            seeds,
            dial_timeout: config.dial_timeout,
            shutdown,
        })
    }

    /// Subscribe to the rendezvous coordinator's lifecycle.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<CoordinatorState> {
        self.coordinator.state()
    }

    /// Dial every seed, then run the rendezvous loop until [`Node::shutdown`]
    /// or a fatal routing failure.
    ///
    /// A completely failed bootstrap is logged but not fatal: the routing
    /// service may still be reachable through peers learned elsewhere.
    ///
    /// # Errors
    ///
    /// [`NodeError::Routing`] when the routing service cannot be joined or
    /// its discovery stream ends.
    pub async fn run(&self) -> Result<(), NodeError> {
        let report =
            bootstrap::connect_all(Arc::clone(&self.host), &self.seeds, self.dial_timeout).await;
        if report.all_failed() {
            warn!("every bootstrap dial failed, continuing without seeds");
        } else {
            info!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                "bootstrap complete"
            );
        }

        self.coordinator.run(self.shutdown.subscribe()).await?;
        Ok(())
    }

    /// Flip the shutdown switch. [`Node::run`] returns `Ok` shortly after.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
