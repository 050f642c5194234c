//! WebSocket support for the coordinator.
//!
//! Clients connect via WebSocket and exchange engine transport events with
//! the coordinator registry and with each other.

mod manager;
mod protocol;
mod transport;

pub use manager::ConnectionManager;
pub use protocol::*;
pub use transport::WsTransport;
