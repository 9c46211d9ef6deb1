//! Optional TOML configuration file.
//!
//! Every field has a command-line flag counterpart; flags always win over
//! the file. A missing file is only an error when the operator asked for it
//! explicitly.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// On-disk configuration, all sections optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Identity and listener settings.
    #[serde(default)]
    pub node: NodeSection,
    /// Rendezvous and bootstrap settings.
    #[serde(default)]
    pub discovery: DiscoverySection,
}

/// `[node]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeSection {
    /// TCP listen port.
    pub listen: Option<u16>,
    /// Identity key file path.
    pub peerkey: Option<PathBuf>,
    /// Hex pre-shared key for a private overlay.
    pub psk: Option<String>,
}

/// `[discovery]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoverySection {
    /// Rendezvous label.
    pub rendezvous: Option<String>,
    /// Routing protocol namespace prefix.
    pub protocol: Option<String>,
    /// Seed peers in `/ip4/…/tcp/…/p2p/…` form.
    pub bootstrap: Option<Vec<String>>,
    /// IP address to advertise instead of 127.0.0.1.
    pub advertise: Option<String>,
}

impl Config {
    /// Parse a TOML configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        let config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("cannot parse config {}: {e}", path.display()))?;
        Ok(config)
    }
}
