//! Data path: relay ready sockets to their peers.
//!
//! Client chunks are written to the upstream verbatim and, once the client's
//! startup message has gone through, checked for a Simple Query whose text is
//! appended to the query log. Upstream chunks go back to the client untouched.
//!
//! Nothing here aborts the relay: a dead direction tears down the pair, every
//! other anomaly is logged and skipped.

use std::io::{self, Read};
use std::sync::Arc;

use mio::{Registry, Token};
use tracing::{debug, trace, warn};

use super::connection::ConnectionManager;
use super::protocol::{inspect_client_chunk, ChunkInspection};
use super::routing::Route;
use super::socket;
use super::stats::RelayStats;
use crate::query_log::QuerySink;

/// Receive buffer capacity. One byte stays reserved, so a single receive
/// yields at most `RECV_BUFFER_SIZE - 1` bytes.
pub const RECV_BUFFER_SIZE: usize = 1024;

/// Receives handled for one socket before yielding to other sockets.
pub const MAX_READS_PER_EVENT: usize = 16;

/// Whether a socket still needs servicing after [`Forwarder::relay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Socket would block, or its pair is gone.
    Drained,
    /// Read budget spent; more data may be waiting.
    Yielded,
}

/// Relays chunks between paired sockets and records simple queries.
pub struct Forwarder<S> {
    sink: S,
    stats: Arc<RelayStats>,
}

impl<S: QuerySink> Forwarder<S> {
    pub fn new(sink: S, stats: Arc<RelayStats>) -> Self {
        Self { sink, stats }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Read what is available on `token` and forward it to the peer.
    ///
    /// Readiness is edge-triggered, so this reads until the socket would
    /// block or the pair is gone, up to [`MAX_READS_PER_EVENT`] receives.
    /// On [`ReadOutcome::Yielded`] the caller must come back to `token`
    /// without waiting for another event. Each receive is its own chunk.
    pub fn relay(
        &mut self,
        manager: &mut ConnectionManager,
        registry: &Registry,
        token: Token,
    ) -> ReadOutcome {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let mut reads = 0;

        while reads < MAX_READS_PER_EVENT {
            let Some(stream) = manager.table_mut().socket_mut(token) else {
                // Pair already torn down earlier in this batch
                debug!(token = token.0, "event for closed descriptor");
                return ReadOutcome::Drained;
            };

            let n = match stream.read(&mut buf[..RECV_BUFFER_SIZE - 1]) {
                Ok(0) => {
                    debug!(token = token.0, "peer closed connection, disconnecting");
                    manager.teardown(registry, token);
                    return ReadOutcome::Drained;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Drained,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(token = token.0, error = %e, "receive failed, disconnecting");
                    manager.teardown(registry, token);
                    return ReadOutcome::Drained;
                }
            };

            reads += 1;
            self.forward_chunk(manager, token, &buf[..n]);
        }

        trace!(token = token.0, reads, "read budget spent, yielding");
        ReadOutcome::Yielded
    }

    fn forward_chunk(&mut self, manager: &mut ConnectionManager, token: Token, chunk: &[u8]) {
        match manager.table().route(token) {
            Some(Route::Client { upstream }) => {
                trace!(
                    client = token.0,
                    upstream = upstream.0,
                    bytes = chunk.len(),
                    "client -> upstream"
                );
                let sent = deliver(manager, upstream, chunk);
                RelayStats::add(&self.stats.bytes_to_upstream, sent);
                RelayStats::add(&self.stats.bytes_dropped, chunk.len() - sent);

                let table = manager.table_mut();
                if table.handshake_seen(token) {
                    self.record_query(token, chunk);
                } else {
                    // First chunk is the startup/negotiation message
                    table.mark_handshake_seen(token);
                }
            }
            Some(Route::Upstream { client }) => {
                trace!(
                    upstream = token.0,
                    client = client.0,
                    bytes = chunk.len(),
                    "upstream -> client"
                );
                let sent = deliver(manager, client, chunk);
                RelayStats::add(&self.stats.bytes_to_client, sent);
                RelayStats::add(&self.stats.bytes_dropped, chunk.len() - sent);
            }
            None => warn!(token = token.0, "unknown descriptor"),
        }
    }

    fn record_query(&mut self, client: Token, chunk: &[u8]) {
        match inspect_client_chunk(chunk) {
            ChunkInspection::Query(text) => {
                debug!(
                    client = client.0,
                    query = %String::from_utf8_lossy(text),
                    "query"
                );
                match self.sink.append_line(text) {
                    Ok(()) => RelayStats::incr(&self.stats.queries_logged),
                    Err(e) => warn!(client = client.0, error = %e, "failed to append query"),
                }
            }
            ChunkInspection::Truncated => {
                RelayStats::incr(&self.stats.malformed_queries);
                warn!(
                    client = client.0,
                    bytes = chunk.len(),
                    "wrong Query message format"
                );
            }
            ChunkInspection::Other => {}
        }
    }
}

/// Best-effort write of `chunk` to `peer`. Returns the bytes written.
fn deliver(manager: &mut ConnectionManager, peer: Token, chunk: &[u8]) -> usize {
    let Some(stream) = manager.table_mut().socket_mut(peer) else {
        warn!(peer = peer.0, "peer missing for live pair");
        return 0;
    };

    match socket::send_best_effort(stream, chunk) {
        Ok(sent) => {
            if sent < chunk.len() {
                warn!(
                    peer = peer.0,
                    sent,
                    dropped = chunk.len() - sent,
                    "peer not writable, dropping bytes"
                );
            }
            sent
        }
        Err(e) => {
            warn!(peer = peer.0, error = %e, "send failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_log::QueryLog;
    use crate::relay::connection::AcceptOutcome;
    use mio::net::TcpListener;
    use mio::Poll;
    use std::io::Write;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    struct Fixture {
        poll: Poll,
        manager: ConnectionManager,
        forwarder: Forwarder<QueryLog<Vec<u8>>>,
        stats: Arc<RelayStats>,
        client: std::net::TcpStream,
        upstream_peer: std::net::TcpStream,
        client_token: Token,
        upstream_token: Token,
        _listener: TcpListener,
    }

    impl Fixture {
        fn new() -> Self {
            let poll = Poll::new().unwrap();
            let upstream = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let stats = Arc::new(RelayStats::default());
            let mut manager =
                ConnectionManager::new(upstream.local_addr().unwrap(), Arc::clone(&stats));

            let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();

            let deadline = Instant::now() + Duration::from_secs(5);
            let (client_token, upstream_token) = loop {
                match manager.accept_one(poll.registry(), &listener) {
                    AcceptOutcome::Paired { client, upstream } => break (client, upstream),
                    AcceptOutcome::Empty if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(5))
                    }
                    other => panic!("Expected Paired, got {:?}", other),
                }
            };

            let (upstream_peer, _) = upstream.accept().unwrap();
            upstream_peer
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();

            Self {
                poll,
                forwarder: Forwarder::new(QueryLog::from_writer(Vec::new()), Arc::clone(&stats)),
                manager,
                stats,
                client,
                upstream_peer,
                client_token,
                upstream_token,
                _listener: listener,
            }
        }

        /// Relay `token` until `done` holds.
        fn pump(&mut self, token: Token, done: impl Fn(&RelayStats) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done(&*self.stats) {
                assert!(Instant::now() < deadline, "relay made no progress");
                self.forwarder
                    .relay(&mut self.manager, self.poll.registry(), token);
                std::thread::sleep(Duration::from_millis(2));
            }
        }

        /// Send a client chunk and wait until the relay forwarded it.
        fn client_sends(&mut self, chunk: &[u8]) -> Vec<u8> {
            let before = self.stats.bytes_to_upstream.load(Ordering::Relaxed);
            self.client.write_all(chunk).unwrap();
            let target = before + chunk.len() as u64;
            let token = self.client_token;
            self.pump(token, |s| {
                s.bytes_to_upstream.load(Ordering::Relaxed) >= target
            });

            let mut received = vec![0u8; chunk.len()];
            self.upstream_peer.read_exact(&mut received).unwrap();
            received
        }

        fn logged(&self) -> String {
            String::from_utf8(self.forwarder.sink().get_ref().clone()).unwrap()
        }
    }

    fn query_message(sql: &str) -> Vec<u8> {
        let mut msg = vec![b'Q'];
        msg.extend_from_slice(&((4 + sql.len() + 1) as u32).to_be_bytes());
        msg.extend_from_slice(sql.as_bytes());
        msg.push(0);
        msg
    }

    #[test]
    fn test_first_chunk_is_never_logged() {
        let mut fx = Fixture::new();

        // Even a chunk that looks like a query is the startup message here
        let first = query_message("SELECT 'startup'");
        assert_eq!(fx.client_sends(&first), first);
        assert_eq!(fx.logged(), "");
        assert!(fx.manager.table().handshake_seen(fx.client_token));

        let second = query_message("SELECT 1");
        assert_eq!(fx.client_sends(&second), second);
        assert_eq!(fx.logged(), "SELECT 1\n");
        assert_eq!(fx.stats.queries_logged.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_truncated_query_is_relayed_not_logged() {
        let mut fx = Fixture::new();
        fx.client_sends(b"\x00\x00\x00\x08\x04\xd2\x16\x2f");

        assert_eq!(fx.client_sends(b"Q"), b"Q");
        assert_eq!(fx.logged(), "");
        assert_eq!(fx.stats.malformed_queries.load(Ordering::Relaxed), 1);
        assert_eq!(fx.manager.table().len(), 1);
    }

    #[test]
    fn test_non_query_messages_are_not_logged() {
        let mut fx = Fixture::new();
        fx.client_sends(b"startup");

        let terminate = b"X\x00\x00\x00\x04";
        assert_eq!(fx.client_sends(terminate), terminate);
        assert_eq!(fx.logged(), "");
    }

    #[test]
    fn test_upstream_bytes_reach_client_untouched() {
        let mut fx = Fixture::new();
        let reply = query_message("looks like a query");

        fx.upstream_peer.write_all(&reply).unwrap();
        let token = fx.upstream_token;
        let len = reply.len() as u64;
        fx.pump(token, |s| s.bytes_to_client.load(Ordering::Relaxed) >= len);

        let mut received = vec![0u8; reply.len()];
        fx.client.read_exact(&mut received).unwrap();
        assert_eq!(received, reply);
        assert_eq!(fx.logged(), "");
    }

    #[test]
    fn test_client_eof_tears_down_pair() {
        let mut fx = Fixture::new();
        fx.client.shutdown(std::net::Shutdown::Write).unwrap();

        let token = fx.client_token;
        fx.pump(token, |s| s.active_pairs() == 0);

        assert!(fx.manager.table().is_empty());
        let mut buf = [0u8; 8];
        assert_eq!(fx.upstream_peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_upstream_eof_tears_down_pair() {
        let mut fx = Fixture::new();
        fx.upstream_peer
            .shutdown(std::net::Shutdown::Write)
            .unwrap();

        let token = fx.upstream_token;
        fx.pump(token, |s| s.active_pairs() == 0);

        assert!(!fx.manager.table().contains(fx.client_token));
        let mut buf = [0u8; 8];
        assert_eq!(fx.client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_large_chunk_split_at_buffer_size() {
        let mut fx = Fixture::new();
        fx.client_sends(b"startup");

        let payload = vec![b'a'; 3000];
        assert_eq!(fx.client_sends(&payload), payload);
    }

    #[test]
    fn test_event_for_unknown_token_is_ignored() {
        let mut fx = Fixture::new();
        let registry = fx.poll.registry();
        let outcome = fx.forwarder.relay(&mut fx.manager, registry, Token(999));

        assert_eq!(outcome, ReadOutcome::Drained);
        assert_eq!(fx.manager.table().len(), 1);
    }

    #[test]
    fn test_busy_socket_yields_after_read_budget() {
        let mut fx = Fixture::new();
        fx.client_sends(b"startup");
        let before = fx.stats.bytes_to_upstream.load(Ordering::Relaxed);

        // More than one budget's worth of full receives
        let budget_bytes = (MAX_READS_PER_EVENT * (RECV_BUFFER_SIZE - 1)) as u64;
        let payload = vec![b'x'; 2 * budget_bytes as usize];
        fx.client.write_all(&payload).unwrap();

        // Wait until the whole payload is readable on the relay side
        let token = fx.client_token;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let mut probe = [0u8; 1];
            let stream = fx.manager.table_mut().socket_mut(token).unwrap();
            let queued = stream.peek(&mut probe).is_ok();
            if queued {
                break;
            }
            assert!(Instant::now() < deadline, "payload never arrived");
            std::thread::sleep(Duration::from_millis(2));
        }
        std::thread::sleep(Duration::from_millis(50));

        let registry = fx.poll.registry();
        let outcome = fx.forwarder.relay(&mut fx.manager, registry, token);
        assert_eq!(outcome, ReadOutcome::Yielded);
        let relayed = fx.stats.bytes_to_upstream.load(Ordering::Relaxed) - before;
        assert!(relayed <= budget_bytes);

        // Coming back finishes the payload
        let total = before + payload.len() as u64;
        fx.pump(token, |s| s.bytes_to_upstream.load(Ordering::Relaxed) >= total);
        let mut received = vec![0u8; payload.len()];
        fx.upstream_peer.read_exact(&mut received).unwrap();
        assert_eq!(received, payload);
    }
}
