//! Application sink interface.
//!
//! A `Handler` receives lifecycle notifications and reassembled messages.
//! Callbacks run inline on the parsing path, so messages from one connection
//! are delivered strictly in arrival order.

use super::frame::{encode_frame, Opcode};
use super::message::Message;
use super::MAX_CONTROL_PAYLOAD;
use crate::runtime::transport::{write_all, Transport};
use bytes::BytesMut;
use std::io;

/// Application callbacks.
pub trait Handler {
    /// Called once, after the opening handshake succeeded.
    fn on_connect(&mut self, session: &mut Session<'_>) {
        let _ = session;
    }

    /// Called once per reassembled message. The message is dropped when this
    /// returns.
    fn on_message(&mut self, session: &mut Session<'_>, message: &Message);

    /// Called exactly once when a connection that completed the handshake is
    /// torn down, whatever the reason.
    fn on_close(&mut self, conn_id: usize) {
        let _ = conn_id;
    }
}

/// The connection as seen from inside a handler callback.
pub struct Session<'a> {
    id: usize,
    transport: &'a mut dyn Transport,
    close_requested: bool,
    failure: Option<io::ErrorKind>,
}

impl<'a> Session<'a> {
    pub(crate) fn new(id: usize, transport: &'a mut dyn Transport) -> Self {
        Self {
            id,
            transport,
            close_requested: false,
            failure: None,
        }
    }

    /// Connection identifier, stable for the connection's lifetime.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Send one unfragmented frame.
    pub fn send(&mut self, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        if self.close_requested {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closing"));
        }
        if let Some(kind) = self.failure {
            return Err(io::Error::new(kind, "connection already failed"));
        }
        if opcode.is_control() && payload.len() as u64 > MAX_CONTROL_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "control frame payload exceeds 125 bytes",
            ));
        }

        let mut buf = BytesMut::new();
        encode_frame(&mut buf, true, opcode, payload, None);
        let result = write_all(&mut *self.transport, &buf);
        if let Err(ref e) = result {
            self.failure = Some(e.kind());
        }
        result
    }

    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send(Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&mut self, data: &[u8]) -> io::Result<()> {
        self.send(Opcode::Binary, data)
    }

    pub fn ping(&mut self, payload: &[u8]) -> io::Result<()> {
        self.send(Opcode::Ping, payload)
    }

    /// Send a normal-closure (1000) close frame. The connection is torn down
    /// as soon as the callback returns.
    pub fn close(&mut self) -> io::Result<()> {
        let result = self.send(Opcode::Close, &1000u16.to_be_bytes());
        self.close_requested = true;
        result
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub(crate) fn failure(&self) -> Option<io::ErrorKind> {
        self.failure
    }
}
