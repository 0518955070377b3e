pub mod config;
pub mod error;
pub mod query_log;
pub mod relay;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use query_log::{QueryLog, QuerySink};
pub use relay::{
    ChunkInspection, Relay, RelayStats, Route, RoutingTable, ShutdownHandle, RECV_BUFFER_SIZE,
};
