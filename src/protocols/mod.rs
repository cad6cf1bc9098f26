//! Protocol implementations.
//!
//! - `websocket`: sans-IO WebSocket core (handshake, framing, reassembly)
//! - `echo`: application handler that sends every message back

pub mod echo;
pub mod websocket;
