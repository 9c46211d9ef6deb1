//! Node-level error type.

use thiserror::Error;

use crate::identity::IdentityError;
use crate::psk::InvalidSecret;
use crate::routing::RoutingError;
use crate::transport::TransportError;

/// Anything that can go wrong while configuring or running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Bad configuration, including an unparsable seed address.
    #[error("configuration: {0}")]
    Config(String),

    /// Identity store failure.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Malformed pre-shared key.
    #[error(transparent)]
    InvalidSecret(#[from] InvalidSecret),

    /// Routing service failure.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl NodeError {
    /// Whether the node cannot continue past this error.
    ///
    /// Startup problems (configuration, identity, secrets) and the loss of
    /// routing are fatal. A failed advertisement or an individual transport
    /// error is not; those are retried or logged where they occur.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Identity(_) | Self::InvalidSecret(_) => true,
            Self::Routing(RoutingError::Bootstrap(_) | RoutingError::DiscoveryStream) => true,
            Self::Routing(RoutingError::Advertise(_)) | Self::Transport(_) => false,
        }
    }
}
