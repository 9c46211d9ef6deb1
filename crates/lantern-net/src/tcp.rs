//! TCP transport host.
//!
//! One TCP connection per logical stream. Directly after connecting, both
//! sides send a single hello line:
//!
//! ```text
//! LANTERN1 <hex-node-id> <hex-psk-proof>
//! ```
//!
//! Each side checks the remote's proof against its own network gate, so a
//! node with the wrong pre-shared key is refused before any payload byte.
//! The initiator then sends the protocol label as a second line and the
//! acceptor dispatches to the handler registered for it. An initiator that
//! hangs up right after the hello is a plain reachability probe.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use lantern_core::identity::Identity;
use lantern_core::peer::{PeerAddr, PeerDirectory};
use lantern_core::psk::GateConfig;
use lantern_core::transport::{PeerStream, StreamHandler, TransportError, TransportHost};
use lantern_core::{NodeId, session};

const HELLO_PREFIX: &str = "LANTERN1";
const MAX_LINE: u64 = 512;

/// A TCP connection speaking the lantern stream protocol.
pub struct TcpPeerStream {
    io: BufReader<TcpStream>,
}

impl tokio::io::AsyncRead for TcpPeerStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for TcpPeerStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl PeerStream for TcpPeerStream {
    fn abort(self: Box<Self>) {
        // Linger zero turns the close into an RST, so the peer sees a
        // connection error instead of EOF.
        let stream = self.io.into_inner();
        let _ = stream.set_linger(Some(Duration::ZERO));
    }
}

struct HostInner {
    id: NodeId,
    gate: GateConfig,
    directory: Arc<PeerDirectory>,
    handlers: DashMap<String, StreamHandler>,
    local_addr: SocketAddr,
}

/// [`TransportHost`] over plain TCP.
pub struct TcpTransportHost {
    inner: Arc<HostInner>,
}

impl TcpTransportHost {
    /// Bind a listener on `port` (zero picks a free port) and start
    /// accepting.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if the listener cannot be bound.
    pub async fn bind(
        identity: &Identity,
        gate: GateConfig,
        port: u16,
    ) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        let inner = Arc::new(HostInner {
            id: identity.node_id(),
            gate,
            directory: PeerDirectory::new(),
            handlers: DashMap::new(),
            local_addr,
        });
        info!(id = %inner.id, addr = %local_addr, "listening");

        let accept_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let inner = Arc::clone(&accept_inner);
                        tokio::spawn(async move {
                            if let Err(e) = accept_one(inner, stream).await {
                                debug!(remote = %remote, error = %e, "inbound connection dropped");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        return;
                    }
                }
            }
        });

        Ok(Arc::new(Self { inner }))
    }

    /// The bound listen address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// This host's own `/ip4/…/tcp/…/p2p/…` form, with the listen IP
    /// replaced by `ip`.
    #[must_use]
    pub fn addr_with_ip(&self, ip: std::net::IpAddr) -> PeerAddr {
        PeerAddr::new(
            self.inner.id,
            vec![SocketAddr::new(ip, self.inner.local_addr.port())],
        )
    }

    async fn dial(&self, peer: &PeerAddr) -> Result<TcpPeerStream, TransportError> {
        if peer.addrs.is_empty() {
            return Err(TransportError::DialFailed(format!(
                "no known address for {}",
                peer.id
            )));
        }
        let mut last = None;
        for addr in &peer.addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let mut io = BufReader::new(stream);
                    let remote = exchange_hello(&mut io, self.inner.id, &self.inner.gate).await?;
                    if remote != peer.id {
                        return Err(TransportError::Handshake(format!(
                            "expected {} but {addr} identifies as {remote}",
                            peer.id
                        )));
                    }
                    return Ok(TcpPeerStream { io });
                }
                Err(e) => {
                    debug!(peer = %peer.id, addr = %addr, error = %e, "dial attempt failed");
                    last = Some(e);
                }
            }
        }
        match last {
            Some(e) => Err(TransportError::DialFailed(e.to_string())),
            None => Err(TransportError::DialFailed("no address".into())),
        }
    }
}

#[async_trait::async_trait]
impl TransportHost for TcpTransportHost {
    fn local_id(&self) -> NodeId {
        self.inner.id
    }

    fn directory(&self) -> Arc<PeerDirectory> {
        Arc::clone(&self.inner.directory)
    }

    fn register_handler(&self, protocol: &str, handler: StreamHandler) {
        self.inner.handlers.insert(protocol.to_string(), handler);
    }

    async fn connect(&self, peer: &PeerAddr) -> Result<(), TransportError> {
        // Dial and handshake, then hang up. The connection proved identity
        // and network membership; streams are opened on demand later.
        let stream = self.dial(peer).await?;
        drop(stream);
        debug!(peer = %peer.id, "reachability established");
        Ok(())
    }

    async fn open_stream(
        &self,
        peer: &NodeId,
        protocol: &str,
    ) -> Result<Box<dyn PeerStream>, TransportError> {
        let addrs = self
            .inner
            .directory
            .addrs_of(peer)
            .ok_or(TransportError::UnknownPeer(*peer))?;
        let target = PeerAddr::new(*peer, addrs);
        let mut stream = self.dial(&target).await?;
        session::write_frame(&mut stream, protocol).await?;
        Ok(Box::new(stream))
    }
}

/// Send our hello, read and verify theirs, return the authenticated remote
/// id.
async fn exchange_hello(
    io: &mut BufReader<TcpStream>,
    local: NodeId,
    gate: &GateConfig,
) -> Result<NodeId, TransportError> {
    let proof = gate.proof(&local);
    let hello = format!(
        "{HELLO_PREFIX} {} {}\n",
        local.to_hex(),
        hex::encode(proof.as_bytes())
    );
    io.write_all(hello.as_bytes()).await?;
    io.flush().await?;

    let mut line = String::new();
    (&mut *io).take(MAX_LINE).read_line(&mut line).await?;
    let (remote, remote_proof) = parse_hello(line.trim_end())?;
    if !gate.verify(&remote, &remote_proof) {
        return Err(TransportError::Handshake(
            "peer is on a different network".into(),
        ));
    }
    Ok(remote)
}

fn parse_hello(line: &str) -> Result<(NodeId, [u8; 32]), TransportError> {
    let bad = |reason: &str| TransportError::Handshake(format!("bad hello: {reason}"));
    let mut parts = line.split_whitespace();
    if parts.next() != Some(HELLO_PREFIX) {
        return Err(bad("unknown protocol magic"));
    }
    let id = parts
        .next()
        .and_then(NodeId::from_hex)
        .ok_or_else(|| bad("malformed node id"))?;
    let proof_hex = parts.next().ok_or_else(|| bad("missing proof"))?;
    let mut proof = [0u8; 32];
    hex::decode_to_slice(proof_hex, &mut proof).map_err(|_| bad("malformed proof"))?;
    if parts.next().is_some() {
        return Err(bad("trailing fields"));
    }
    Ok((id, proof))
}

async fn accept_one(inner: Arc<HostInner>, stream: TcpStream) -> Result<(), TransportError> {
    let mut io = BufReader::new(stream);
    let remote = exchange_hello(&mut io, inner.id, &inner.gate).await?;

    let mut protocol = String::new();
    let n = (&mut io).take(MAX_LINE).read_line(&mut protocol).await?;
    if n == 0 {
        // Reachability probe: handshake done, nothing requested.
        debug!(peer = %remote, "probe connection");
        return Ok(());
    }
    let protocol = protocol.trim_end();

    let handler = inner
        .handlers
        .get(protocol)
        .map(|h| Arc::clone(h.value()))
        .ok_or_else(|| TransportError::UnknownProtocol(protocol.to_string()))?;
    debug!(peer = %remote, protocol, "inbound stream");
    handler(remote, Box::new(TcpPeerStream { io }));
    Ok(())
}
