//! In-process transport and routing, used by tests and local demos.
//!
//! [`MemoryNetwork`] hands out hosts that talk over paired in-memory duplex
//! streams, enforcing the same network-gate rule the TCP transport does: two
//! hosts connect only if their gates derive the same network tag.
//! [`MemoryRegistry`] is a routing service over the same process.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use crate::identity::NodeId;
use crate::peer::{PeerAddr, PeerDirectory};
use crate::psk::GateConfig;
use crate::routing::{RoutingError, RoutingService};
use crate::transport::{PeerStream, StreamHandler, TransportError, TransportHost};

const STREAM_CAPACITY: usize = 64 * 1024;

/// One end of a paired in-memory stream.
///
/// Aborting either end makes every later read or write on the peer fail with
/// `ConnectionReset`, mirroring a TCP reset.
pub struct MemoryStream {
    inner: DuplexStream,
    reset: Arc<AtomicBool>,
}

impl MemoryStream {
    /// Create a connected pair.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(STREAM_CAPACITY);
        let reset = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner: a,
                reset: Arc::clone(&reset),
            },
            Self { inner: b, reset },
        )
    }

    fn check_reset(&self) -> io::Result<()> {
        if self.reset.load(Ordering::Acquire) {
            Err(io::ErrorKind::ConnectionReset.into())
        } else {
            Ok(())
        }
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Err(e) = self.check_reset() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Err(e) = self.check_reset() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl PeerStream for MemoryStream {
    fn abort(self: Box<Self>) {
        // Set the flag first, then drop the duplex half. The drop wakes a
        // peer blocked in read, which then observes the flag.
        self.reset.store(true, Ordering::Release);
    }
}

struct HostState {
    tag: blake3::Hash,
    handlers: DashMap<String, StreamHandler>,
    directory: Arc<PeerDirectory>,
}

/// A process-local network of [`MemoryHost`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hosts: Arc<DashMap<NodeId, Arc<HostState>>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a host with the given identity and network gate.
    #[must_use]
    pub fn host(&self, id: NodeId, gate: &GateConfig) -> Arc<MemoryHost> {
        let state = Arc::new(HostState {
            tag: gate.network_tag(),
            handlers: DashMap::new(),
            directory: PeerDirectory::new(),
        });
        self.hosts.insert(id, Arc::clone(&state));
        Arc::new(MemoryHost {
            id,
            state,
            hosts: Arc::clone(&self.hosts),
        })
    }
}

/// An in-process [`TransportHost`].
pub struct MemoryHost {
    id: NodeId,
    state: Arc<HostState>,
    hosts: Arc<DashMap<NodeId, Arc<HostState>>>,
}

impl MemoryHost {
    fn remote(&self, id: &NodeId) -> Result<Arc<HostState>, TransportError> {
        let remote = self
            .hosts
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| TransportError::DialFailed(format!("no route to {id}")))?;
        if remote.tag != self.state.tag {
            return Err(TransportError::Handshake(
                "peer is on a different network".into(),
            ));
        }
        Ok(remote)
    }
}

#[async_trait]
impl TransportHost for MemoryHost {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn directory(&self) -> Arc<PeerDirectory> {
        Arc::clone(&self.state.directory)
    }

    fn register_handler(&self, protocol: &str, handler: StreamHandler) {
        self.state.handlers.insert(protocol.to_string(), handler);
    }

    async fn connect(&self, peer: &PeerAddr) -> Result<(), TransportError> {
        self.remote(&peer.id).map(|_| ())
    }

    async fn open_stream(
        &self,
        peer: &NodeId,
        protocol: &str,
    ) -> Result<Box<dyn PeerStream>, TransportError> {
        if !self.state.directory.contains(peer) {
            return Err(TransportError::UnknownPeer(*peer));
        }
        let remote = self.remote(peer)?;
        let handler = remote
            .handlers
            .get(protocol)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| TransportError::UnknownProtocol(protocol.to_string()))?;

        let (local, far) = MemoryStream::pair();
        debug!(from = %self.id, to = %peer, protocol, "in-memory stream opened");
        handler(self.id, Box::new(far));
        Ok(Box::new(local))
    }
}

struct LabelState {
    announced: std::sync::Mutex<Vec<PeerAddr>>,
    notify: broadcast::Sender<PeerAddr>,
}

/// A process-local rendezvous registry shared by [`MemoryRouting`] handles.
pub struct MemoryRegistry {
    labels: DashMap<String, Arc<LabelState>>,
    closed: watch::Sender<bool>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            labels: DashMap::new(),
            closed,
        })
    }

    fn label(&self, label: &str) -> Arc<LabelState> {
        Arc::clone(
            self.labels
                .entry(label.to_string())
                .or_insert_with(|| {
                    let (notify, _) = broadcast::channel(64);
                    Arc::new(LabelState {
                        announced: std::sync::Mutex::new(Vec::new()),
                        notify,
                    })
                })
                .value(),
        )
    }

    /// End every open discovery stream.
    pub fn close(&self) {
        let _ = self.closed.send(true);
    }

    /// A routing handle that announces `local` when asked to advertise.
    #[must_use]
    pub fn routing_for(self: &Arc<Self>, local: PeerAddr) -> MemoryRouting {
        MemoryRouting {
            registry: Arc::clone(self),
            local,
            fail_bootstrap: false,
        }
    }
}

/// An in-process [`RoutingService`] backed by a [`MemoryRegistry`].
pub struct MemoryRouting {
    registry: Arc<MemoryRegistry>,
    local: PeerAddr,
    fail_bootstrap: bool,
}

impl MemoryRouting {
    /// A handle whose [`RoutingService::bootstrap`] always fails.
    #[must_use]
    pub fn failing(registry: &Arc<MemoryRegistry>, local: PeerAddr) -> Self {
        Self {
            registry: Arc::clone(registry),
            local,
            fail_bootstrap: true,
        }
    }
}

#[async_trait]
impl RoutingService for MemoryRouting {
    async fn bootstrap(&self) -> Result<(), RoutingError> {
        if self.fail_bootstrap {
            return Err(RoutingError::Bootstrap("registry unreachable".into()));
        }
        Ok(())
    }

    async fn advertise(&self, label: &str) -> Result<(), RoutingError> {
        let state = self.registry.label(label);
        state
            .announced
            .lock()
            .map_err(|_| RoutingError::Advertise("registry poisoned".into()))?
            .push(self.local.clone());
        let _ = state.notify.send(self.local.clone());
        Ok(())
    }

    async fn find_peers(&self, label: &str) -> Result<mpsc::Receiver<PeerAddr>, RoutingError> {
        let state = self.registry.label(label);
        // Subscribe before snapshotting so an announcement between the two
        // steps is seen at least once.
        let mut notify = state.notify.subscribe();
        let snapshot: Vec<PeerAddr> = state
            .announced
            .lock()
            .map_err(|_| RoutingError::Advertise("registry poisoned".into()))?
            .clone();
        let mut closed = self.registry.closed.subscribe();

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for peer in snapshot {
                if tx.send(peer).await.is_err() {
                    return;
                }
            }
            loop {
                let peer = tokio::select! {
                    _ = closed.changed() => return,
                    peer = notify.recv() => peer,
                };
                match peer {
                    Ok(peer) => {
                        if tx.send(peer).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }
}
