//! Event loop and shutdown coordination.
//!
//! One thread waits on the multiplexer and handles ready sockets one at a
//! time: listener readiness goes to the connection manager, everything else
//! to the forwarder. The shutdown flag is checked once per iteration; when it
//! is set the loop stops accepting and polling and tears down every pair.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace};

use super::connection::{AcceptOutcome, ConnectionManager};
use super::forward::{Forwarder, ReadOutcome};
use super::shutdown::ShutdownHandle;
use super::socket;
use super::stats::RelayStats;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::query_log::QuerySink;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Events handled per wait.
const EVENT_CAPACITY: usize = 32;

/// Wait bound while clients may be stuck in the listener's queue.
const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A single-threaded relay between database clients and one upstream.
pub struct Relay<S> {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    manager: ConnectionManager,
    forwarder: Forwarder<S>,
    stats: Arc<RelayStats>,
    /// Sockets whose read budget ran out, serviced again before blocking.
    pending_reads: Vec<Token>,
    /// A hard accept failure may have left clients queued.
    accept_backlog: bool,
}

impl<S: QuerySink> Relay<S> {
    /// Resolve the upstream, bind the listener and set up the multiplexer.
    ///
    /// `shutdown` is owned by the caller; once it reads `true` the relay
    /// stops at its next loop iteration.
    pub fn bind(config: RelayConfig, sink: S, shutdown: Arc<AtomicBool>) -> Result<Self> {
        config.validate()?;
        let upstream_addr = config.resolve_upstream()?;

        let poll = Poll::new().map_err(RelayError::Multiplexer)?;

        let bind_addr = socket::listen_addr(config.listen_port);
        let mut listener = socket::bind_listener(config.listen_port).map_err(|source| {
            RelayError::Bind {
                addr: bind_addr,
                source,
            }
        })?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(RelayError::Multiplexer)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(RelayError::Multiplexer)?);

        let local_addr = listener.local_addr().unwrap_or(bind_addr);
        info!(
            listen_addr = %local_addr,
            upstream_addr = %upstream_addr,
            "relay bound"
        );

        let stats = Arc::new(RelayStats::default());

        Ok(Self {
            poll,
            listener,
            waker,
            shutdown,
            manager: ConnectionManager::new(upstream_addr, Arc::clone(&stats)),
            forwarder: Forwarder::new(sink, Arc::clone(&stats)),
            stats,
            pending_reads: Vec::new(),
            accept_backlog: false,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Live relay statistics.
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Handle that sets the shutdown flag and wakes the loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(Arc::clone(&self.shutdown), Arc::clone(&self.waker))
    }

    /// Number of live client/upstream pairs.
    pub fn active_pairs(&self) -> usize {
        self.manager.table().len()
    }

    pub fn into_sink(self) -> S {
        self.forwarder.into_sink()
    }

    /// Run until the shutdown flag is set, then close every pair.
    ///
    /// Returns an error only if waiting for readiness fails for a reason
    /// other than signal interruption. Pairs are torn down in that case too.
    pub fn run(&mut self) -> Result<()> {
        self.run_with(|poll, events, timeout| poll.poll(events, timeout))
    }

    /// The loop behind [`Relay::run`], with the readiness wait supplied by
    /// the caller.
    fn run_with<W>(&mut self, mut wait: W) -> Result<()>
    where
        W: FnMut(&mut Poll, &mut Events, Option<Duration>) -> io::Result<()>,
    {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        info!("relay started");

        let result = loop {
            if self.shutdown_requested() {
                break Ok(());
            }

            let timeout = self.wait_timeout();
            if let Err(e) = wait(&mut self.poll, &mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    debug!("readiness wait interrupted");
                    continue;
                }
                error!(error = %e, "readiness wait failed");
                break Err(RelayError::Wait(e));
            }

            if std::mem::take(&mut self.accept_backlog) {
                self.accept_pending();
            }

            let carried = std::mem::take(&mut self.pending_reads);
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_pending(),
                    WAKER => trace!("relay woken"),
                    token => self.service(token),
                }
            }
            for token in carried {
                // Already serviced by an event in this batch and still busy
                if !self.pending_reads.contains(&token) {
                    self.service(token);
                }
            }
        };

        info!("shutting down gracefully");
        self.pending_reads.clear();
        let closed = self.manager.teardown_all(self.poll.registry());
        info!(
            pairs_closed = closed,
            connections_accepted = self.stats.connections_accepted.load(Ordering::Relaxed),
            queries_logged = self.stats.queries_logged.load(Ordering::Relaxed),
            bytes_to_upstream = self.stats.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client = self.stats.bytes_to_client.load(Ordering::Relaxed),
            "relay stopped"
        );

        result
    }

    /// Block until an event, unless work is already waiting.
    fn wait_timeout(&self) -> Option<Duration> {
        if !self.pending_reads.is_empty() {
            Some(Duration::ZERO)
        } else if self.accept_backlog {
            Some(ACCEPT_RETRY_INTERVAL)
        } else {
            None
        }
    }

    /// Relay one socket; keep it queued if its read budget ran out.
    fn service(&mut self, token: Token) {
        let outcome = self
            .forwarder
            .relay(&mut self.manager, self.poll.registry(), token);
        if outcome == ReadOutcome::Yielded && !self.pending_reads.contains(&token) {
            self.pending_reads.push(token);
        }
    }

    /// Accept until the listener's queue is empty.
    ///
    /// The listener is edge-triggered: a hard accept failure leaves queued
    /// clients without a new event, so the next wait is bounded and the
    /// queue is tried again.
    fn accept_pending(&mut self) {
        loop {
            // No new pairs once shutdown has been requested
            if self.shutdown_requested() {
                return;
            }
            match self.manager.accept_one(self.poll.registry(), &self.listener) {
                AcceptOutcome::Paired { .. }
                | AcceptOutcome::Dropped
                | AcceptOutcome::Transient => continue,
                AcceptOutcome::Failed => {
                    self.accept_backlog = true;
                    return;
                }
                AcceptOutcome::Empty => return,
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
