//! Request handlers that outlive a single HTTP exchange.

mod websocket;

pub use websocket::handle_websocket_connection;
