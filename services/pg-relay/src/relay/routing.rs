//! Routing table for live connection pairs.
//!
//! Every pair is stored in both directions (client -> upstream and
//! upstream -> client) so a ready token can be dispatched without knowing
//! which side it is. The table owns the sockets of every pair it holds, so a
//! descriptor cannot be reused by the OS while its entry is present.
//!
//! Pairs are inserted and removed as a unit; a half-registered pair is never
//! visible through this API.

use std::collections::{HashMap, HashSet};

use mio::Token;

/// Which side of a pair a token belongs to, and its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Token is a client socket; traffic goes to `upstream`.
    Client { upstream: Token },
    /// Token is an upstream socket; traffic goes to `client`.
    Upstream { client: Token },
}

impl Route {
    /// Token of the other side.
    pub fn peer(&self) -> Token {
        match *self {
            Route::Client { upstream } => upstream,
            Route::Upstream { client } => client,
        }
    }
}

/// Both ends of a pair, handed back on removal.
#[derive(Debug)]
pub struct PairEnds<S> {
    pub client_token: Token,
    pub client: S,
    pub upstream_token: Token,
    pub upstream: S,
}

/// Bidirectional client/upstream mapping plus per-client handshake markers.
#[derive(Debug)]
pub struct RoutingTable<S> {
    client_to_upstream: HashMap<Token, Token>,
    upstream_to_client: HashMap<Token, Token>,
    /// Clients whose startup message has already been forwarded.
    handshake_seen: HashSet<Token>,
    sockets: HashMap<Token, S>,
}

impl<S> Default for RoutingTable<S> {
    fn default() -> Self {
        Self {
            client_to_upstream: HashMap::new(),
            upstream_to_client: HashMap::new(),
            handshake_seen: HashSet::new(),
            sockets: HashMap::new(),
        }
    }
}

impl<S> RoutingTable<S> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully established pair.
    ///
    /// Both tokens must be fresh; the caller allocates them.
    pub fn insert(&mut self, client_token: Token, client: S, upstream_token: Token, upstream: S) {
        debug_assert!(!self.sockets.contains_key(&client_token));
        debug_assert!(!self.sockets.contains_key(&upstream_token));

        self.client_to_upstream.insert(client_token, upstream_token);
        self.upstream_to_client.insert(upstream_token, client_token);
        self.sockets.insert(client_token, client);
        self.sockets.insert(upstream_token, upstream);
    }

    /// Look up which side `token` is on.
    pub fn route(&self, token: Token) -> Option<Route> {
        if let Some(&upstream) = self.client_to_upstream.get(&token) {
            return Some(Route::Client { upstream });
        }
        self.upstream_to_client
            .get(&token)
            .map(|&client| Route::Upstream { client })
    }

    pub fn contains(&self, token: Token) -> bool {
        self.sockets.contains_key(&token)
    }

    pub fn socket_mut(&mut self, token: Token) -> Option<&mut S> {
        self.sockets.get_mut(&token)
    }

    /// Whether the client's first chunk has already been forwarded.
    pub fn handshake_seen(&self, client: Token) -> bool {
        self.handshake_seen.contains(&client)
    }

    /// Mark the client's startup message as forwarded.
    ///
    /// Ignored for tokens that are not a live client.
    pub fn mark_handshake_seen(&mut self, client: Token) {
        if self.client_to_upstream.contains_key(&client) {
            self.handshake_seen.insert(client);
        }
    }

    /// Remove the pair containing `token`, from either side.
    ///
    /// Returns `None` if the pair was already removed.
    pub fn remove(&mut self, token: Token) -> Option<PairEnds<S>> {
        let (client_token, upstream_token) = match self.route(token)? {
            Route::Client { upstream } => (token, upstream),
            Route::Upstream { client } => (client, token),
        };

        self.client_to_upstream.remove(&client_token);
        self.upstream_to_client.remove(&upstream_token);
        self.handshake_seen.remove(&client_token);

        let client = self.sockets.remove(&client_token)?;
        let upstream = self.sockets.remove(&upstream_token)?;

        Some(PairEnds {
            client_token,
            client,
            upstream_token,
            upstream,
        })
    }

    /// Remove every pair and clear all bookkeeping.
    pub fn drain(&mut self) -> Vec<PairEnds<S>> {
        let clients: Vec<Token> = self.client_to_upstream.keys().copied().collect();
        let pairs = clients
            .into_iter()
            .filter_map(|client| self.remove(client))
            .collect();

        self.client_to_upstream.clear();
        self.upstream_to_client.clear();
        self.handshake_seen.clear();
        self.sockets.clear();

        pairs
    }

    /// Number of live pairs.
    pub fn len(&self) -> usize {
        self.client_to_upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.client_to_upstream.is_empty()
    }
}
