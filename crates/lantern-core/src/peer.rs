//! Peer addressing and the shared peer directory.
//!
//! Peers are written as self-describing address strings of the form
//! `/ip4/203.0.113.7/tcp/7001/p2p/<64-hex-node-id>`. The directory maps node
//! ids to known socket addresses with a TTL class: permanent entries
//! (bootstrap seeds) are never evicted, ephemeral entries (discovered peers)
//! may be pruned once stale.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;

use crate::identity::NodeId;

/// A malformed peer address string. Fatal when it comes from the compiled-in
/// seed list.
#[derive(Debug, Error)]
#[error("malformed peer address {input:?}: {reason}")]
pub struct PeerAddrError {
    /// The offending input.
    pub input: String,
    /// What was wrong with it.
    pub reason: String,
}

impl PeerAddrError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// A peer's identity plus the socket addresses it may be reached at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddr {
    /// The peer's node identifier.
    pub id: NodeId,
    /// Reachable addresses, most preferred first.
    pub addrs: Vec<SocketAddr>,
}

impl PeerAddr {
    /// Create a peer address record.
    #[must_use]
    pub fn new(id: NodeId, addrs: Vec<SocketAddr>) -> Self {
        Self { id, addrs }
    }
}

impl FromStr for PeerAddr {
    type Err = PeerAddrError;

    /// Parse `/ip4/<addr>/tcp/<port>/p2p/<hex-node-id>` (or `/ip6/…`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            ["", ip_proto @ ("ip4" | "ip6"), ip, "tcp", port, "p2p", id_hex] => {
                let ip: IpAddr = ip
                    .parse()
                    .map_err(|e| PeerAddrError::new(s, format!("bad {ip_proto} address: {e}")))?;
                if (ip.is_ipv4() && *ip_proto != "ip4") || (ip.is_ipv6() && *ip_proto != "ip6") {
                    return Err(PeerAddrError::new(s, "address family does not match prefix"));
                }
                let port: u16 = port
                    .parse()
                    .map_err(|e| PeerAddrError::new(s, format!("bad port: {e}")))?;
                let id = NodeId::from_hex(id_hex)
                    .ok_or_else(|| PeerAddrError::new(s, "node id must be 64 hex characters"))?;
                Ok(Self::new(id, vec![SocketAddr::new(ip, port)]))
            }
            _ => Err(PeerAddrError::new(
                s,
                "expected /ip4/<addr>/tcp/<port>/p2p/<node-id>",
            )),
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addrs.first() {
            Some(addr) => {
                let family = if addr.is_ipv4() { "ip4" } else { "ip6" };
                write!(
                    f,
                    "/{family}/{}/tcp/{}/p2p/{}",
                    addr.ip(),
                    addr.port(),
                    self.id.to_hex()
                )
            }
            None => write!(f, "/p2p/{}", self.id.to_hex()),
        }
    }
}

/// Time-to-live classification for directory entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrTtl {
    /// Never evicted. Used for bootstrap seeds.
    Permanent,
    /// May be evicted once stale. Used for discovered peers.
    Ephemeral,
}

/// One directory record.
#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    /// Known socket addresses for the peer.
    pub addrs: Vec<SocketAddr>,
    /// Eviction class.
    pub ttl: AddrTtl,
    /// Last time the entry was inserted or refreshed.
    pub last_seen: Instant,
}

/// Concurrent map of every peer this node knows how to reach.
///
/// Safe under concurrent writers: the bootstrap connector and the rendezvous
/// coordinator insert entries from independent tasks. Each mutation touches a
/// single entry; nothing spans entries.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    entries: DashMap<NodeId, DirectoryEntry>,
}

impl PeerDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add or refresh a peer, merging addresses.
    ///
    /// A `Permanent` entry is never downgraded to `Ephemeral`.
    pub fn insert(&self, peer: &PeerAddr, ttl: AddrTtl) {
        let mut entry = self
            .entries
            .entry(peer.id)
            .or_insert_with(|| DirectoryEntry {
                addrs: Vec::new(),
                ttl,
                last_seen: Instant::now(),
            });
        for addr in &peer.addrs {
            if !entry.addrs.contains(addr) {
                entry.addrs.push(*addr);
            }
        }
        if ttl == AddrTtl::Permanent {
            entry.ttl = AddrTtl::Permanent;
        }
        entry.last_seen = Instant::now();
    }

    /// Known addresses for a peer, if any.
    #[must_use]
    pub fn addrs_of(&self, id: &NodeId) -> Option<Vec<SocketAddr>> {
        self.entries.get(id).map(|e| e.addrs.clone())
    }

    /// TTL class for a peer, if known.
    #[must_use]
    pub fn ttl_of(&self, id: &NodeId) -> Option<AddrTtl> {
        self.entries.get(id).map(|e| e.ttl)
    }

    /// Whether a peer has a directory entry.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict ephemeral entries not refreshed within `max_age`.
    ///
    /// Permanent entries always survive. Returns the number evicted.
    pub fn prune(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        let cutoff = Instant::now();
        self.entries.retain(|_, entry| {
            entry.ttl == AddrTtl::Permanent
                || cutoff.duration_since(entry.last_seen) <= max_age
        });
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8, addr: &str) -> PeerAddr {
        PeerAddr::new(NodeId::from_bytes([byte; 32]), vec![addr.parse().unwrap()])
    }

    #[test]
    fn parse_ip4_peer_addr() {
        let id_hex = "ab".repeat(32);
        let s = format!("/ip4/122.99.183.54/tcp/7001/p2p/{id_hex}");
        let peer: PeerAddr = s.parse().unwrap();
        assert_eq!(peer.addrs, vec!["122.99.183.54:7001".parse().unwrap()]);
        assert_eq!(peer.id.to_hex(), id_hex);
        assert_eq!(peer.to_string(), s);
    }

    #[test]
    fn parse_ip6_peer_addr() {
        let s = format!("/ip6/::1/tcp/6000/p2p/{}", "01".repeat(32));
        let peer: PeerAddr = s.parse().unwrap();
        assert_eq!(peer.addrs[0].port(), 6000);
        assert!(peer.addrs[0].is_ipv6());
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in [
            "",
            "/ip4/1.2.3.4/tcp/7001",
            "/ip4/1.2.3.4/udp/7001/p2p/aa",
            "/ip4/not-an-ip/tcp/7001/p2p/aa",
            "/ip4/1.2.3.4/tcp/99999/p2p/aa",
            &format!("/ip4/1.2.3.4/tcp/7001/p2p/{}", "zz".repeat(32)),
        ] {
            assert!(bad.parse::<PeerAddr>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn insert_merges_addresses() {
        let dir = PeerDirectory::new();
        dir.insert(&peer(1, "10.0.0.1:7001"), AddrTtl::Ephemeral);
        dir.insert(&peer(1, "10.0.0.2:7001"), AddrTtl::Ephemeral);

        let addrs = dir.addrs_of(&NodeId::from_bytes([1u8; 32])).unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn permanent_is_never_downgraded() {
        let dir = PeerDirectory::new();
        let id = NodeId::from_bytes([1u8; 32]);
        dir.insert(&peer(1, "10.0.0.1:7001"), AddrTtl::Permanent);
        dir.insert(&peer(1, "10.0.0.1:7001"), AddrTtl::Ephemeral);
        assert_eq!(dir.ttl_of(&id), Some(AddrTtl::Permanent));
    }

    #[test]
    fn prune_spares_permanent_entries() {
        let dir = PeerDirectory::new();
        dir.insert(&peer(1, "10.0.0.1:7001"), AddrTtl::Permanent);
        dir.insert(&peer(2, "10.0.0.2:7001"), AddrTtl::Ephemeral);

        let evicted = dir.prune(Duration::ZERO);
        assert_eq!(evicted, 1);
        assert!(dir.contains(&NodeId::from_bytes([1u8; 32])));
        assert!(!dir.contains(&NodeId::from_bytes([2u8; 32])));
    }

    #[test]
    fn prune_keeps_fresh_ephemeral() {
        let dir = PeerDirectory::new();
        dir.insert(&peer(2, "10.0.0.2:7001"), AddrTtl::Ephemeral);
        assert_eq!(dir.prune(Duration::from_secs(60)), 0);
        assert_eq!(dir.len(), 1);
    }
}
