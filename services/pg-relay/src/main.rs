//! plfm-vt pg-relay
//!
//! Transparent TCP relay in front of a PostgreSQL server.
//!
//! This service:
//! - Accepts client connections on a local port
//! - Opens one upstream connection per client
//! - Forwards bytes unmodified in both directions
//! - Appends the text of every Simple Query to a query log
//! - Closes all pairs on SIGINT / SIGTERM

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use plfm_pg_relay::config::{DEFAULT_LISTEN_PORT, DEFAULT_UPSTREAM_PORT};
use plfm_pg_relay::{QueryLog, Relay, RelayConfig};

mod logging;

use logging::LogFormat;

/// Relay PostgreSQL traffic and record simple queries.
#[derive(Debug, Parser)]
#[command(name = "pg-relay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Upstream PostgreSQL host.
    #[arg(long, env = "PG_RELAY_UPSTREAM_HOST", default_value = "127.0.0.1")]
    upstream_host: String,

    /// Upstream PostgreSQL port.
    #[arg(long, env = "PG_RELAY_UPSTREAM_PORT", default_value_t = DEFAULT_UPSTREAM_PORT)]
    upstream_port: u16,

    /// Local port to accept clients on (all IPv4 addresses).
    #[arg(long, env = "PG_RELAY_LISTEN_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    listen_port: u16,

    /// File that extracted queries are appended to.
    #[arg(long, env = "PG_RELAY_QUERY_LOG", default_value = "queries.log")]
    query_log: PathBuf,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "PG_RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Diagnostic log format.
    #[arg(long, env = "PG_RELAY_LOG_FORMAT", value_enum, default_value = "compact")]
    log_format: LogFormat,
}

impl Cli {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig::new(&self.upstream_host, self.upstream_port, self.listen_port)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.log_level, cli.log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(1);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "pg-relay failed");
            for cause in e.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.relay_config();
    info!(
        upstream_host = %config.upstream_host,
        upstream_port = config.upstream_port,
        listen_port = config.listen_port,
        query_log = %cli.query_log.display(),
        "Starting pg-relay"
    );

    let sink = QueryLog::open(&cli.query_log)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut relay = Relay::bind(config, sink, shutdown).context("relay setup failed")?;

    let handle = relay.shutdown_handle();
    ctrlc::set_handler(move || handle.trigger()).context("failed to install signal handler")?;

    relay.run()?;
    Ok(())
}
