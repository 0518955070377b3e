//! Error types for the relay.
//!
//! Only setup failures and a failed readiness wait leave the relay as errors.
//! Per-connection failures are logged and handled where they happen.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid startup configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Upstream host could not be resolved.
    #[error("failed to resolve upstream {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Readiness multiplexer could not be created or set up.
    #[error("multiplexer setup failed: {0}")]
    Multiplexer(#[source] io::Error),

    /// Query log could not be opened.
    #[error("failed to open query log {}: {source}", path.display())]
    QueryLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Readiness wait failed for a reason other than signal interruption.
    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),
}

impl RelayError {
    /// Short machine-readable code for log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config_invalid",
            RelayError::Resolve { .. } => "upstream_unresolved",
            RelayError::Bind { .. } => "bind_failed",
            RelayError::Multiplexer(_) => "multiplexer_failed",
            RelayError::QueryLog { .. } => "query_log_failed",
            RelayError::Wait(_) => "wait_failed",
        }
    }
}

/// Result alias for relay setup and run.
pub type Result<T> = std::result::Result<T, RelayError>;
