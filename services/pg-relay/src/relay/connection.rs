//! Connection pairing and teardown.
//!
//! A pair becomes visible in the routing table only after the accepted client
//! and the connected upstream are both non-blocking and registered. Any
//! failure on the way releases whatever was already set up and leaves the
//! table untouched.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::routing::{PairEnds, RoutingTable};
use super::socket;
use super::stats::RelayStats;

/// Tokens below this are reserved for the listener and the waker.
pub const FIRST_PAIR_TOKEN: usize = 2;

/// Result of one accept attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A new pair is live.
    Paired { client: Token, upstream: Token },
    /// A client was accepted but dropped before a pair could be formed.
    Dropped,
    /// Accept failed for a reason that clears on its own (aborted handshake,
    /// signal). The next pending connection can be tried right away.
    Transient,
    /// Accept failed, typically on descriptor or memory exhaustion. Clients
    /// may still be queued and need another attempt later.
    Failed,
    /// No connection was pending.
    Empty,
}

/// Stage at which pair setup failed.
#[derive(Debug, Error)]
enum PairSetupError {
    #[error("client registration failed: {0}")]
    RegisterClient(#[source] io::Error),

    #[error("upstream connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("upstream registration failed: {0}")]
    RegisterUpstream(#[source] io::Error),
}

/// Accepts clients, opens upstream connections, and tears pairs down.
pub struct ConnectionManager {
    upstream_addr: SocketAddr,
    table: RoutingTable<TcpStream>,
    next_token: usize,
    stats: Arc<RelayStats>,
}

impl ConnectionManager {
    pub fn new(upstream_addr: SocketAddr, stats: Arc<RelayStats>) -> Self {
        Self {
            upstream_addr,
            table: RoutingTable::new(),
            next_token: FIRST_PAIR_TOKEN,
            stats,
        }
    }

    pub fn table(&self) -> &RoutingTable<TcpStream> {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut RoutingTable<TcpStream> {
        &mut self.table
    }

    /// Accept one pending client and pair it with a new upstream connection.
    pub fn accept_one(&mut self, registry: &Registry, listener: &TcpListener) -> AcceptOutcome {
        let (client, peer_addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return AcceptOutcome::Empty,
            Err(e) if is_transient_accept_error(&e) => {
                RelayStats::incr(&self.stats.accept_failures);
                debug!(error = %e, "accept interrupted, retrying");
                return AcceptOutcome::Transient;
            }
            Err(e) => {
                RelayStats::incr(&self.stats.accept_failures);
                warn!(error = %e, "accept failed, backlog deferred");
                return AcceptOutcome::Failed;
            }
        };

        RelayStats::incr(&self.stats.connections_accepted);

        match self.open_pair(registry, client) {
            Ok((client, upstream)) => {
                info!(
                    peer_addr = %peer_addr,
                    client = client.0,
                    upstream = upstream.0,
                    "client connected"
                );
                AcceptOutcome::Paired { client, upstream }
            }
            Err(e) => {
                if matches!(e, PairSetupError::Connect(_)) {
                    RelayStats::incr(&self.stats.upstream_connect_failures);
                }
                warn!(
                    peer_addr = %peer_addr,
                    upstream_addr = %self.upstream_addr,
                    error = %e,
                    "dropping client"
                );
                AcceptOutcome::Dropped
            }
        }
    }

    /// Register the client, connect and register the upstream, then publish
    /// the pair.
    fn open_pair(
        &mut self,
        registry: &Registry,
        mut client: TcpStream,
    ) -> Result<(Token, Token), PairSetupError> {
        // Accepted sockets come back from mio already non-blocking
        let client_token = self.allocate_token();
        if let Err(e) = registry.register(&mut client, client_token, Interest::READABLE) {
            socket::close(client);
            return Err(PairSetupError::RegisterClient(e));
        }

        // Blocks the loop until the upstream answers or refuses
        let mut upstream = match socket::connect_upstream(self.upstream_addr) {
            Ok(upstream) => upstream,
            Err(e) => {
                release(registry, client);
                return Err(PairSetupError::Connect(e));
            }
        };

        let upstream_token = self.allocate_token();
        if let Err(e) = registry.register(&mut upstream, upstream_token, Interest::READABLE) {
            release(registry, client);
            socket::close(upstream);
            return Err(PairSetupError::RegisterUpstream(e));
        }

        self.table.insert(client_token, client, upstream_token, upstream);
        self.stats.pair_opened();

        Ok((client_token, upstream_token))
    }

    /// Tear down the pair containing `token`, from either side.
    ///
    /// Returns `false` if the pair was already gone.
    pub fn teardown(&mut self, registry: &Registry, token: Token) -> bool {
        match self.table.remove(token) {
            Some(ends) => {
                debug!(
                    client = ends.client_token.0,
                    upstream = ends.upstream_token.0,
                    "tearing down pair"
                );
                self.release_pair(registry, ends);
                true
            }
            None => false,
        }
    }

    /// Tear down every live pair. Returns how many were closed.
    pub fn teardown_all(&mut self, registry: &Registry) -> usize {
        let pairs = self.table.drain();
        let closed = pairs.len();
        for ends in pairs {
            self.release_pair(registry, ends);
        }
        closed
    }

    fn release_pair(&self, registry: &Registry, ends: PairEnds<TcpStream>) {
        release(registry, ends.client);
        release(registry, ends.upstream);
        self.stats.pair_closed();
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}

/// Accept errors that say nothing about the next queued connection.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Deregister and close a registered socket.
fn release(registry: &Registry, mut stream: TcpStream) {
    if let Err(e) = registry.deregister(&mut stream) {
        debug!(error = %e, "deregister failed");
    }
    socket::close(stream);
}
