pub mod backoff;
pub mod connection;
pub mod protocol;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use connection::{Connection, ConnectionEvent, ConnectionOptions, StateObserver};
pub use types::{ConnectionState, McpServerInfo, Tool, TransportSpec};
