//! Private network admission gate.
//!
//! An optional 32-byte pre-shared key partitions the network: every transport
//! host configured with the same secret forms a private overlay, and hosts
//! with differing secrets cannot complete a stream handshake. Absence of a
//! key means the network is open.
//!
//! The key itself never crosses the wire. Handshakes exchange a BLAKE3 keyed
//! hash of the sender's node id, so a mismatch surfaces as a handshake
//! failure rather than data corruption. Open-network hosts derive the proof
//! from an all-zero key so the wire shape is identical either way.

use rand_core::{OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::NodeId;

/// Length of a pre-shared key in bytes.
pub const PSK_LEN: usize = 32;

const OPEN_NETWORK_KEY: [u8; PSK_LEN] = [0u8; PSK_LEN];

/// A textual secret that failed to decode. Fatal at startup.
#[derive(Debug, Error)]
#[error("invalid pre-shared key: {0}")]
pub struct InvalidSecret(pub String);

/// Fixed-length shared secret gating admission to a private overlay.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PreSharedKey([u8; PSK_LEN]);

impl PreSharedKey {
    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; PSK_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Decode an operator-supplied hex string (exactly 64 hex characters).
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSecret`] for any other length or non-hex input.
    pub fn from_hex(s: &str) -> Result<Self, InvalidSecret> {
        let bytes = hex::decode(s)
            .map_err(|e| InvalidSecret(format!("not valid hex: {e}")))?;
        let key: [u8; PSK_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            InvalidSecret(format!("expected {PSK_LEN} bytes, found {}", b.len()))
        })?;
        Ok(Self(key))
    }

    /// Hex form for handing to other operators.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        write!(f, "PreSharedKey(..)")
    }
}

/// Immutable admission configuration handed to a transport host at
/// construction. There is no dynamic secret rotation.
#[derive(Clone, Debug, Default)]
pub struct GateConfig {
    psk: Option<PreSharedKey>,
}

impl GateConfig {
    /// An open network: any peer may connect.
    #[must_use]
    pub fn open() -> Self {
        Self { psk: None }
    }

    /// A private overlay gated by `psk`.
    #[must_use]
    pub fn with_psk(psk: PreSharedKey) -> Self {
        Self { psk: Some(psk) }
    }

    /// Configure the gate from an optional operator-supplied hex secret.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSecret`] when the secret is present but malformed.
    pub fn from_hex(secret: Option<&str>) -> Result<Self, InvalidSecret> {
        match secret {
            None => Ok(Self::open()),
            Some(s) => Ok(Self::with_psk(PreSharedKey::from_hex(s)?)),
        }
    }

    /// Whether a secret is configured.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.psk.is_some()
    }

    fn key(&self) -> &[u8; PSK_LEN] {
        self.psk.as_ref().map_or(&OPEN_NETWORK_KEY, |k| &k.0)
    }

    /// Handshake proof binding `node_id` to this gate's secret.
    ///
    /// [`blake3::Hash`] compares in constant time.
    #[must_use]
    pub fn proof(&self, node_id: &NodeId) -> blake3::Hash {
        blake3::keyed_hash(self.key(), node_id.as_bytes())
    }

    /// Verify a peer's handshake proof against this gate's secret.
    #[must_use]
    pub fn verify(&self, node_id: &NodeId, proof: &[u8; 32]) -> bool {
        self.proof(node_id) == blake3::Hash::from_bytes(*proof)
    }

    /// Opaque tag identifying the overlay this gate admits to.
    ///
    /// Two gates admit each other exactly when their tags are equal. Used by
    /// the in-memory transport in place of a wire handshake.
    #[must_use]
    pub fn network_tag(&self) -> blake3::Hash {
        blake3::keyed_hash(self.key(), b"lantern-network-tag")
    }
}
