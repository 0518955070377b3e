//! Relay counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for a relay.
///
/// Written only by the event loop thread; atomics let other threads read them
/// while the relay runs.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Client connections accepted.
    pub connections_accepted: AtomicU64,
    /// Accept calls that failed.
    pub accept_failures: AtomicU64,
    /// Upstream connects that failed (client dropped).
    pub upstream_connect_failures: AtomicU64,
    /// Pairs that became live.
    pub pairs_opened: AtomicU64,
    /// Pairs currently live.
    pub pairs_active: AtomicU64,
    /// Pairs torn down.
    pub pairs_closed: AtomicU64,
    /// Bytes relayed client -> upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed upstream -> client.
    pub bytes_to_client: AtomicU64,
    /// Bytes that could not be written to a peer.
    pub bytes_dropped: AtomicU64,
    /// Queries appended to the query log.
    pub queries_logged: AtomicU64,
    /// Simple-Query chunks too short to carry a header.
    pub malformed_queries: AtomicU64,
}

impl RelayStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn pair_opened(&self) {
        Self::incr(&self.pairs_opened);
        Self::incr(&self.pairs_active);
    }

    pub(crate) fn pair_closed(&self) {
        Self::incr(&self.pairs_closed);
        self.pairs_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current number of live pairs.
    pub fn active_pairs(&self) -> u64 {
        self.pairs_active.load(Ordering::Relaxed)
    }
}
