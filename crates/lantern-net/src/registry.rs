//! Registry routing: advertise and discover peers through registry nodes.
//!
//! Registry nodes (usually the bootstrap seeds) keep a label table and serve
//! it over a line protocol on `<prefix>/registry/1.0.0`:
//!
//! ```text
//! -> ANNOUNCE <label> <peer-addr>
//! <- OK
//!
//! -> FIND <label>
//! <- PEER <peer-addr>        (one line per announcement, past and future)
//! ```
//!
//! A `FIND` stream stays open indefinitely; announcements arriving later are
//! pushed down every open stream for that label.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::BufReader;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lantern_core::peer::{AddrTtl, PeerAddr};
use lantern_core::routing::{RoutingError, RoutingService};
use lantern_core::session::{read_frame, write_frame};
use lantern_core::transport::{PeerStream, StreamHandler, TransportHost};
use lantern_core::{DEFAULT_PROTOCOL_PREFIX, NodeId};

/// Protocol label suffix appended to the configured namespace prefix.
pub const REGISTRY_PROTOCOL_SUFFIX: &str = "/registry/1.0.0";

/// Default re-announcement cadence for [`RegistryRouting::advertise`].
pub const DEFAULT_ADVERTISE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Full registry protocol label for a namespace prefix.
#[must_use]
pub fn registry_protocol(prefix: &str) -> String {
    format!("{prefix}{REGISTRY_PROTOCOL_SUFFIX}")
}

struct LabelFeed {
    announced: Mutex<Vec<PeerAddr>>,
    notify: broadcast::Sender<PeerAddr>,
}

/// Server side of the registry protocol. Runs as a stream handler on the
/// bootstrap role.
#[derive(Default)]
pub struct RegistryServer {
    labels: DashMap<String, Arc<LabelFeed>>,
}

impl RegistryServer {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn feed(&self, label: &str) -> Arc<LabelFeed> {
        Arc::clone(
            self.labels
                .entry(label.to_string())
                .or_insert_with(|| {
                    let (notify, _) = broadcast::channel(64);
                    Arc::new(LabelFeed {
                        announced: Mutex::new(Vec::new()),
                        notify,
                    })
                })
                .value(),
        )
    }

    fn record(&self, label: &str, peer: PeerAddr) -> std::io::Result<()> {
        let feed = self.feed(label);
        {
            let mut announced = feed
                .announced
                .lock()
                .map_err(|_| std::io::Error::other("label table poisoned"))?;
            // Re-announcement replaces the old record for the same node.
            announced.retain(|p| p.id != peer.id);
            announced.push(peer.clone());
        }
        let _ = feed.notify.send(peer);
        Ok(())
    }

    /// The [`StreamHandler`] to register under the registry protocol label.
    #[must_use]
    pub fn handler(self: &Arc<Self>) -> StreamHandler {
        let server = Arc::clone(self);
        Arc::new(move |peer, stream| {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(e) = server.serve(peer, stream).await {
                    debug!(peer = %peer, error = %e, "registry connection ended");
                }
            });
        })
    }

    async fn serve(&self, peer: NodeId, stream: Box<dyn PeerStream>) -> std::io::Result<()> {
        let mut io = BufReader::new(stream);
        loop {
            let Some(command) = read_frame(&mut io).await? else {
                return Ok(());
            };
            let mut parts = command.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("ANNOUNCE"), Some(label), Some(addr)) => {
                    match addr.parse::<PeerAddr>() {
                        Ok(announced) => {
                            info!(peer = %peer, label, addr = %announced, "announcement");
                            self.record(label, announced)?;
                            write_frame(&mut io, "OK").await?;
                        }
                        Err(e) => write_frame(&mut io, &format!("ERR {e}")).await?,
                    }
                }
                (Some("FIND"), Some(label), None) => {
                    debug!(peer = %peer, label, "find stream opened");
                    return self.stream_label(label, io).await;
                }
                _ => {
                    write_frame(&mut io, "ERR unknown command").await?;
                    return Ok(());
                }
            }
        }
    }

    async fn stream_label(
        &self,
        label: &str,
        mut io: BufReader<Box<dyn PeerStream>>,
    ) -> std::io::Result<()> {
        let feed = self.feed(label);
        // Subscribe before snapshotting so nothing announced in between is
        // lost.
        let mut notify = feed.notify.subscribe();
        let snapshot = feed
            .announced
            .lock()
            .map_err(|_| std::io::Error::other("label table poisoned"))?
            .clone();
        for peer in snapshot {
            write_frame(&mut io, &format!("PEER {peer}")).await?;
        }
        loop {
            match notify.recv().await {
                Ok(peer) => write_frame(&mut io, &format!("PEER {peer}")).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(label, skipped, "find stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// Client side of the registry protocol, implementing [`RoutingService`].
pub struct RegistryRouting {
    host: Arc<dyn TransportHost>,
    registry_peers: Vec<PeerAddr>,
    protocol: String,
    local: PeerAddr,
    advertise_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistryRouting {
    /// A routing client that reaches the registries at `registry_peers` and
    /// announces `local` when advertising.
    #[must_use]
    pub fn new(host: Arc<dyn TransportHost>, registry_peers: Vec<PeerAddr>, local: PeerAddr) -> Self {
        Self {
            host,
            registry_peers,
            protocol: registry_protocol(DEFAULT_PROTOCOL_PREFIX),
            local,
            advertise_interval: DEFAULT_ADVERTISE_INTERVAL,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Override the protocol namespace prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.protocol = registry_protocol(prefix);
        self
    }

    /// Override the re-announcement cadence.
    #[must_use]
    pub fn with_advertise_interval(mut self, interval: Duration) -> Self {
        self.advertise_interval = interval;
        self
    }

    fn keep(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    async fn announce_to(
        host: &Arc<dyn TransportHost>,
        registry: &PeerAddr,
        protocol: &str,
        label: &str,
        local: &PeerAddr,
    ) -> Result<(), RoutingError> {
        let advertise = |e: std::io::Error| RoutingError::Advertise(e.to_string());
        let stream = host
            .open_stream(&registry.id, protocol)
            .await
            .map_err(|e| RoutingError::Advertise(e.to_string()))?;
        let mut io = BufReader::new(stream);
        write_frame(&mut io, &format!("ANNOUNCE {label} {local}"))
            .await
            .map_err(advertise)?;
        match read_frame(&mut io).await.map_err(advertise)? {
            Some(reply) if reply == "OK" => Ok(()),
            Some(reply) => Err(RoutingError::Advertise(format!("registry refused: {reply}"))),
            None => Err(RoutingError::Advertise("registry hung up".into())),
        }
    }

    async fn announce_all(
        host: &Arc<dyn TransportHost>,
        registries: &[PeerAddr],
        protocol: &str,
        label: &str,
        local: &PeerAddr,
    ) -> usize {
        let mut placed = 0;
        for registry in registries {
            match Self::announce_to(host, registry, protocol, label, local).await {
                Ok(()) => placed += 1,
                Err(e) => warn!(registry = %registry.id, error = %e, "announce failed"),
            }
        }
        placed
    }
}

impl Drop for RegistryRouting {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

#[async_trait::async_trait]
impl RoutingService for RegistryRouting {
    async fn bootstrap(&self) -> Result<(), RoutingError> {
        if self.registry_peers.is_empty() {
            return Err(RoutingError::Bootstrap("no registry peers configured".into()));
        }
        let mut last = String::new();
        for registry in &self.registry_peers {
            self.host.directory().insert(registry, AddrTtl::Permanent);
            match self.host.connect(registry).await {
                Ok(()) => {
                    debug!(registry = %registry.id, "registry reachable");
                    return Ok(());
                }
                Err(e) => last = e.to_string(),
            }
        }
        Err(RoutingError::Bootstrap(format!(
            "no registry peer reachable, last error: {last}"
        )))
    }

    async fn advertise(&self, label: &str) -> Result<(), RoutingError> {
        let placed = Self::announce_all(
            &self.host,
            &self.registry_peers,
            &self.protocol,
            label,
            &self.local,
        )
        .await;

        // Background re-announcement runs whether or not the first round
        // landed; registries may come back later.
        let host = Arc::clone(&self.host);
        let registries = self.registry_peers.clone();
        let protocol = self.protocol.clone();
        let label_owned = label.to_string();
        let local = self.local.clone();
        let interval = self.advertise_interval;
        self.keep(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                Self::announce_all(&host, &registries, &protocol, &label_owned, &local).await;
            }
        }));

        if placed == 0 {
            return Err(RoutingError::Advertise(
                "no registry accepted the announcement".into(),
            ));
        }
        Ok(())
    }

    async fn find_peers(&self, label: &str) -> Result<mpsc::Receiver<PeerAddr>, RoutingError> {
        let (tx, rx) = mpsc::channel(32);
        let seen: Arc<DashMap<NodeId, ()>> = Arc::new(DashMap::new());

        for registry in &self.registry_peers {
            let host = Arc::clone(&self.host);
            let registry = registry.clone();
            let protocol = self.protocol.clone();
            let label = label.to_string();
            let tx = tx.clone();
            let seen = Arc::clone(&seen);
            self.keep(tokio::spawn(async move {
                if let Err(e) = follow_find_stream(host, &registry, &protocol, &label, tx, seen).await
                {
                    warn!(registry = %registry.id, error = %e, "find stream ended");
                }
            }));
        }
        // When every find task is gone the receiver closes, which the
        // coordinator treats as losing discovery.
        drop(tx);
        Ok(rx)
    }
}

async fn follow_find_stream(
    host: Arc<dyn TransportHost>,
    registry: &PeerAddr,
    protocol: &str,
    label: &str,
    tx: mpsc::Sender<PeerAddr>,
    seen: Arc<DashMap<NodeId, ()>>,
) -> Result<(), String> {
    let stream = host
        .open_stream(&registry.id, protocol)
        .await
        .map_err(|e| e.to_string())?;
    let mut io = BufReader::new(stream);
    write_frame(&mut io, &format!("FIND {label}"))
        .await
        .map_err(|e| e.to_string())?;

    loop {
        let line = read_frame(&mut io).await.map_err(|e| e.to_string())?;
        let Some(line) = line else {
            return Ok(());
        };
        let Some(addr) = line.strip_prefix("PEER ") else {
            debug!(registry = %registry.id, line, "unexpected registry line");
            continue;
        };
        match addr.parse::<PeerAddr>() {
            Ok(peer) => {
                // Fan-in across registries, first sighting wins.
                if seen.insert(peer.id, ()).is_none() && tx.send(peer).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => debug!(registry = %registry.id, error = %e, "bad peer line"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_label_includes_prefix() {
        assert_eq!(registry_protocol("/lantern"), "/lantern/registry/1.0.0");
        assert_eq!(registry_protocol("/custom"), "/custom/registry/1.0.0");
    }
}
