//! Relay configuration.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{RelayError, Result};

/// Default upstream PostgreSQL port.
pub const DEFAULT_UPSTREAM_PORT: u16 = 5432;

/// Default local listening port.
pub const DEFAULT_LISTEN_PORT: u16 = 5434;

/// Where to relay and where to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Upstream database host (name or address).
    pub upstream_host: String,
    /// Upstream database port.
    pub upstream_port: u16,
    /// Local port to listen on (all IPv4 addresses). 0 picks a free port.
    pub listen_port: u16,
}

impl RelayConfig {
    /// Create a new relay configuration.
    pub fn new(upstream_host: impl Into<String>, upstream_port: u16, listen_port: u16) -> Self {
        Self {
            upstream_host: upstream_host.into(),
            upstream_port,
            listen_port,
        }
    }

    /// Check the configuration before any socket is created.
    pub fn validate(&self) -> Result<()> {
        if self.upstream_host.trim().is_empty() {
            return Err(RelayError::Config("upstream host must not be empty".into()));
        }
        if self.upstream_port == 0 {
            return Err(RelayError::Config("upstream port must not be 0".into()));
        }
        Ok(())
    }

    /// Resolve the upstream address once, at startup.
    ///
    /// IPv4 results are preferred since the listener is IPv4-only.
    pub fn resolve_upstream(&self) -> Result<SocketAddr> {
        let resolve_err = |source| RelayError::Resolve {
            host: self.upstream_host.clone(),
            port: self.upstream_port,
            source,
        };

        let addrs: Vec<SocketAddr> = (self.upstream_host.as_str(), self.upstream_port)
            .to_socket_addrs()
            .map_err(resolve_err)?
            .collect();

        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                resolve_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no addresses returned",
                ))
            })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_UPSTREAM_PORT, DEFAULT_LISTEN_PORT)
    }
}
