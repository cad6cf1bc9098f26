//! grow-a-websocket: a WebSocket server built around a sans-IO core.
//!
//! The protocol core (`protocols::websocket` plus `runtime::Connection`) never
//! touches a socket. Drivers read bytes, feed them in, and flush what the core
//! writes through a `Transport`:
//!
//! - `runtime::run`: mio readiness loop, one poller per worker thread
//! - `server::Server`: tokio, one task per connection

pub mod config;
pub mod protocols;
pub mod runtime;
pub mod server;
