//! Broker connections.

mod connection;
mod manager;

pub use connection::{Connection, ConnectionId};
pub use manager::{ConnectionEvent, ConnectionManager};
