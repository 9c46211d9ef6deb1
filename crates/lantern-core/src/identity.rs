//! Durable node identity.
//!
//! Every node owns one Ed25519 keypair persisted to a file chosen by the
//! operator. The node identifier is derived from the public key with BLAKE3,
//! so regenerating the key file irrevocably changes the node's identity.
//!
//! A corrupt key file is a fatal condition, distinct from a missing one:
//! silently regenerating over a damaged file would discard an existing
//! identity without the operator noticing.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use thiserror::Error;

/// Length of a serialized identity key (Ed25519 seed) in bytes.
pub const IDENTITY_KEY_LEN: usize = 32;

/// Errors from loading or persisting an identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No key file exists at the given path. Recoverable by generation.
    #[error("identity file not found")]
    NotFound,

    /// The key file exists but does not contain a valid key. Fatal.
    #[error("identity file is corrupt: {0}")]
    Corrupt(String),

    /// Underlying filesystem failure.
    #[error("identity I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stable 256-bit node identifier, derived from the identity public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Derive a node identifier from an Ed25519 public key.
    #[must_use]
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(public_key);
        hasher.update(b"lantern-node-id"); // Domain separation
        Self(*hasher.finalize().as_bytes())
    }

    /// Create a node identifier from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the identifier.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full 64-character hex form, as used in peer address strings.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the full 64-character hex form.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

/// A node's durable identity: Ed25519 keypair plus derived [`NodeId`].
///
/// Immutable for the process lifetime. Shared by reference with the
/// transport host, which presents the node id during stream handshakes.
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
    node_id: NodeId,
}

impl Identity {
    /// Load an identity from a key file.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotFound`] when no file exists at `path`,
    /// [`IdentityError::Corrupt`] when the file does not hold a valid key.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let bytes = fs::read(path.as_ref()).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                IdentityError::NotFound
            } else {
                IdentityError::Io(e)
            }
        })?;
        let seed: [u8; IDENTITY_KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            IdentityError::Corrupt(format!(
                "expected {IDENTITY_KEY_LEN}-byte key, found {} bytes",
                bytes.len()
            ))
        })?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    /// Generate a fresh identity and persist it before returning.
    ///
    /// The key is written to a temporary sibling file and atomically renamed
    /// into place, so a crash mid-write never leaves a half-written key at
    /// `path`. The file is created with owner-only read/write permission.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Io`] if the key cannot be persisted.
    pub fn generate(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let signing = SigningKey::generate(&mut OsRng);
        save_key(path.as_ref(), &signing)?;
        Ok(Self::from_signing_key(signing))
    }

    /// Load the identity at `path`, generating one if none exists yet.
    ///
    /// A corrupt key file is propagated, never overwritten.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        match Self::load(path.as_ref()) {
            Ok(identity) => {
                tracing::info!(node_id = %identity.node_id(), "loaded peer key");
                Ok(identity)
            }
            Err(IdentityError::NotFound) => {
                let identity = Self::generate(path.as_ref())?;
                tracing::info!(node_id = %identity.node_id(), "generated peer key");
                Ok(identity)
            }
            Err(e) => Err(e),
        }
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let node_id = NodeId::from_public_key(&signing.verifying_key().to_bytes());
        Self { signing, node_id }
    }

    /// The node identifier derived from this identity's public key.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The Ed25519 public key.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

fn save_key(path: &Path, signing: &SigningKey) -> Result<(), IdentityError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| IdentityError::Corrupt("key path has no file name".to_string()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, signing.to_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
