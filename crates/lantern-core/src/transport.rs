//! The transport seam: streams, hosts, and transport errors.
//!
//! Everything above this module works against [`TransportHost`] and
//! [`PeerStream`], never a concrete socket type. The TCP transport lives in
//! `lantern-net`; an in-process transport for tests lives in [`crate::mem`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::NodeId;
use crate::peer::{PeerAddr, PeerDirectory};

/// Errors from dialing, handshaking, or using a peer stream.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An underlying I/O failure.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),

    /// No address for the peer could be reached.
    #[error("dial failed: {0}")]
    DialFailed(String),

    /// The post-connect handshake failed or the peer is on another network.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The operation did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer has no entry in the directory.
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    /// The remote registered no handler for the requested protocol.
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

    /// The host has shut down.
    #[error("transport closed")]
    Closed,
}

/// A reliable, ordered, duplex byte stream to one peer.
///
/// Dropping a stream closes it gracefully; [`PeerStream::abort`] tears it
/// down immediately so the remote observes an error rather than a clean EOF.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Abort the stream. The remote's next read fails instead of ending
    /// cleanly.
    fn abort(self: Box<Self>);
}

/// Callback invoked for each inbound stream on a registered protocol.
pub type StreamHandler = Arc<dyn Fn(NodeId, Box<dyn PeerStream>) + Send + Sync>;

/// A node's endpoint on the network.
///
/// Hosts authenticate peers during connection establishment and refuse peers
/// outside the node's network gate, so everything above this trait can trust
/// the [`NodeId`] attached to a stream.
#[async_trait]
pub trait TransportHost: Send + Sync {
    /// This node's identifier.
    fn local_id(&self) -> NodeId;

    /// The shared peer directory backing [`TransportHost::open_stream`].
    fn directory(&self) -> Arc<PeerDirectory>;

    /// Register `handler` for inbound streams labeled `protocol`.
    ///
    /// Registering the same protocol again replaces the previous handler.
    fn register_handler(&self, protocol: &str, handler: StreamHandler);

    /// Establish reachability to `peer`, verifying identity and network
    /// membership. No stream is opened.
    async fn connect(&self, peer: &PeerAddr) -> Result<(), TransportError>;

    /// Open an outbound stream for `protocol` to a peer already in the
    /// directory.
    async fn open_stream(
        &self,
        peer: &NodeId,
        protocol: &str,
    ) -> Result<Box<dyn PeerStream>, TransportError>;
}
