//! Echo handler.

use crate::protocols::websocket::{Handler, Message, Session};
use tracing::{debug, trace};

/// Sends each message back unchanged.
#[derive(Debug, Default)]
pub struct EchoHandler {
    messages: u64,
    bytes: u64,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages echoed so far across all connections this handler served.
    pub fn messages(&self) -> u64 {
        self.messages
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Handler for EchoHandler {
    fn on_connect(&mut self, session: &mut Session<'_>) {
        debug!(conn_id = session.id(), "Client connected");
    }

    fn on_message(&mut self, session: &mut Session<'_>, message: &Message) {
        trace!(
            conn_id = session.id(),
            opcode = ?message.opcode(),
            len = message.len(),
            "Echoing message"
        );
        // A failed send is picked up by the connection after we return.
        if session.send(message.opcode(), message.payload()).is_ok() {
            self.messages += 1;
            self.bytes += message.len() as u64;
        }
    }

    fn on_close(&mut self, conn_id: usize) {
        debug!(conn_id, "Client disconnected");
    }
}
