//! Concurrent bootstrap connector.
//!
//! Dials every configured seed peer in parallel, records each seed in the
//! peer directory with a permanent TTL, and waits for every attempt to
//! settle before reporting. Individual failures are logged and tolerated;
//! only the caller decides what an all-failed report means.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::peer::{AddrTtl, PeerAddr};
use crate::transport::{TransportError, TransportHost};

/// Default per-seed dial deadline.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// The settled result of one seed dial.
#[derive(Debug)]
pub struct BootstrapOutcome {
    /// The seed that was dialed.
    pub peer: PeerAddr,
    /// `Ok` if reachability was established.
    pub result: Result<(), TransportError>,
}

/// Every seed's outcome, available only once all attempts have settled.
#[derive(Debug, Default)]
pub struct ConnectReport {
    /// One outcome per configured seed, in no particular order.
    pub outcomes: Vec<BootstrapOutcome>,
}

impl ConnectReport {
    /// Number of seeds that were reached.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    /// Number of seeds that were not.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// True when seeds were configured and none could be reached.
    #[must_use]
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.succeeded() == 0
    }
}

/// Dial every seed concurrently and wait for all attempts to settle.
///
/// Each seed is entered into the host's directory with [`AddrTtl::Permanent`]
/// before its dial starts, so seeds stay reachable for later streams whether
/// or not this particular dial lands. A dial that outlives `dial_timeout` is
/// abandoned and reported as [`TransportError::Timeout`].
pub async fn connect_all(
    host: Arc<dyn TransportHost>,
    seeds: &[PeerAddr],
    dial_timeout: Duration,
) -> ConnectReport {
    let mut tasks = JoinSet::new();
    for seed in seeds {
        if seed.id == host.local_id() {
            debug!(peer = %seed.id, "skipping self in seed list");
            continue;
        }
        host.directory().insert(seed, AddrTtl::Permanent);
        let host = Arc::clone(&host);
        let seed = seed.clone();
        tasks.spawn(async move {
            let result = match timeout(dial_timeout, host.connect(&seed)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(dial_timeout)),
            };
            BootstrapOutcome { peer: seed, result }
        });
    }

    let mut report = ConnectReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => {
                match &outcome.result {
                    Ok(()) => debug!(peer = %outcome.peer.id, "bootstrap dial succeeded"),
                    Err(e) => warn!(peer = %outcome.peer.id, error = %e, "bootstrap dial failed"),
                }
                report.outcomes.push(outcome);
            }
            Err(e) => warn!(error = %e, "bootstrap dial task panicked"),
        }
    }
    report
}
