//! Single-threaded TCP relay with query extraction.
//!
//! This module provides:
//! - Listener and multiplexer setup
//! - Client/upstream pairing with symmetric teardown
//! - Byte forwarding in both directions
//! - Simple Query extraction on the client -> upstream direction
//!
//! ## Architecture
//!
//! ```text
//! Client <-> Relay (mio Poll) <-> Upstream
//!              |
//!         Query log sink
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use plfm_pg_relay::{QueryLog, Relay, RelayConfig};
//!
//! let shutdown = Arc::new(AtomicBool::new(false));
//! let config = RelayConfig::new("127.0.0.1", 5432, 5434);
//! let mut relay = Relay::bind(config, QueryLog::open("queries.log")?, shutdown)?;
//! relay.run()?;
//! ```

mod connection;
mod event_loop;
mod forward;
mod protocol;
mod routing;
mod shutdown;
mod socket;
mod stats;

pub use connection::{AcceptOutcome, ConnectionManager};
pub use event_loop::Relay;
pub use forward::{Forwarder, ReadOutcome, MAX_READS_PER_EVENT, RECV_BUFFER_SIZE};
pub use protocol::{inspect_client_chunk, ChunkInspection, MSG_QUERY, QUERY_HEADER_LEN};
pub use routing::{PairEnds, Route, RoutingTable};
pub use shutdown::ShutdownHandle;
pub use stats::RelayStats;
