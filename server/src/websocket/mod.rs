//! WebSocket support for realtime invalidation.
//!
//! Clients keep a socket open and are told to pull when server data changes
//! out of band.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
