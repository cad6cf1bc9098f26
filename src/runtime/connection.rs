//! Connection state machine.
//!
//! A `Connection` owns everything one peer can make the server hold: the
//! handshake buffer while connecting, the frame being assembled, and the
//! fragment chain of a message in progress. Drivers feed it bytes and act on
//! the returned `ProcessResult`.

use crate::protocols::websocket::frame::CLOSE_FRAME;
use crate::protocols::websocket::handshake::{self, HandshakeCollector, HandshakeError, HandshakeStatus};
use crate::protocols::websocket::message::{control_action, ControlAction, FragmentChain};
use crate::protocols::websocket::parser::{FrameAssembler, FrameError, Step};
use crate::protocols::websocket::{Frame, Handler, Limits, ProtocolError, Session};
use crate::protocols::websocket::MAX_HEADER_LEN;
use crate::runtime::buffer::{BufferError, ByteBuffer};
use crate::runtime::transport::{write_all, Transport};
use slab::Slab;
use std::fmt;
use std::io;
use tracing::{debug, trace, warn};

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Collecting the opening handshake.
    Connecting,
    /// The 101 response is written but still held by the driver. Nothing is
    /// delivered to the handler until `on_flushed`.
    Upgrading,
    /// Exchanging frames.
    Open,
    /// A close frame has been sent or received; teardown is in progress.
    Closing,
    /// Torn down. No further processing happens.
    Closed,
}

/// Why a connection was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Read returned EOF.
    PeerClosed,
    /// Peer sent a close frame.
    CloseFrame,
    /// Closed by the handler or the server.
    LocalClose,
    /// Peer violated the framing rules.
    Protocol(ProtocolError),
    /// Opening handshake failed.
    Handshake(HandshakeError),
    /// Read or write failed.
    Transport(io::ErrorKind),
    /// Memory for this connection could not be obtained.
    Resource(BufferError),
}

impl CloseReason {
    /// True for resource exhaustion, which drivers report separately.
    pub fn is_resource(&self) -> bool {
        matches!(self, CloseReason::Resource(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::CloseFrame => write!(f, "close frame received"),
            CloseReason::LocalClose => write!(f, "closed locally"),
            CloseReason::Protocol(e) => write!(f, "protocol error: {e}"),
            CloseReason::Handshake(e) => write!(f, "handshake failed: {e}"),
            CloseReason::Transport(kind) => write!(f, "transport error: {kind}"),
            CloseReason::Resource(e) => write!(f, "resource exhausted: {e}"),
        }
    }
}

/// Result of handing an event to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// Still open; keep reading.
    Continue,
    /// Torn down while handling this event.
    Closed(CloseReason),
    /// Already torn down earlier; the event was ignored.
    Stale,
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct Connection {
    id: usize,
    phase: Phase,
    /// Present only while `Connecting`.
    handshake: Option<HandshakeCollector>,
    assembler: FrameAssembler,
    chain: FragmentChain,
    /// Bytes that arrived while `Upgrading`.
    early: ByteBuffer,
    /// Set once `on_connect` ran; `on_close` is owed exactly once after that.
    connected: bool,
}

impl Connection {
    /// Create a connection in the `Connecting` phase.
    pub fn new(id: usize, limits: &Limits) -> Self {
        Self {
            id,
            phase: Phase::Connecting,
            handshake: Some(HandshakeCollector::new(limits)),
            assembler: FrameAssembler::new(limits),
            chain: FragmentChain::new(limits.max_message_size),
            early: ByteBuffer::new(
                limits.chunk_size,
                limits.max_frame_size.saturating_add(MAX_HEADER_LEN),
            ),
            connected: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Number of frames held for a fragmented message in progress.
    pub fn pending_fragments(&self) -> usize {
        self.chain.len()
    }

    /// True while a frame is partially received.
    pub fn has_partial_frame(&self) -> bool {
        !self.assembler.is_idle()
    }

    /// Bytes arrived from the peer.
    pub fn on_data<T: Transport, H: Handler>(
        &mut self,
        data: &[u8],
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        match self.phase {
            Phase::Connecting => self.handle_handshake(data, transport, handler),
            Phase::Upgrading => self.stash(data, transport, handler),
            Phase::Open => self.handle_frames(data, transport, handler),
            Phase::Closing | Phase::Closed => ProcessResult::Stale,
        }
    }

    /// The driver has handed everything the core wrote to the socket.
    ///
    /// Completes an upgrade held back in `Upgrading`: runs `on_connect`, then
    /// any frames that arrived in the meantime. A no-op in other phases.
    pub fn on_flushed<T: Transport, H: Handler>(
        &mut self,
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        match self.phase {
            Phase::Upgrading => {
                let chunk_size = self.early.chunk_size();
                let early = std::mem::replace(&mut self.early, ByteBuffer::new(chunk_size, 0));
                self.open(early.as_slice(), transport, handler)
            }
            Phase::Closed => ProcessResult::Stale,
            _ => ProcessResult::Continue,
        }
    }

    /// Read returned EOF.
    pub fn on_eof<T: Transport, H: Handler>(
        &mut self,
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        self.teardown(CloseReason::PeerClosed, transport, handler)
    }

    /// Read or write failed outside the core.
    pub fn on_transport_error<T: Transport, H: Handler>(
        &mut self,
        kind: io::ErrorKind,
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        self.teardown(CloseReason::Transport(kind), transport, handler)
    }

    /// Close from the server side: send a normal-closure frame if open, then
    /// tear down.
    pub fn close<T: Transport, H: Handler>(
        &mut self,
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        if self.phase == Phase::Open {
            self.phase = Phase::Closing;
            let _ = write_all(transport, &[0x88, 0x02, 0x03, 0xE8]);
        }
        self.teardown(CloseReason::LocalClose, transport, handler)
    }

    /// Fail the connection: best-effort bare close frame, then teardown.
    pub fn fail<T: Transport, H: Handler>(
        &mut self,
        reason: CloseReason,
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        if matches!(self.phase, Phase::Open | Phase::Closing) {
            let _ = write_all(transport, &CLOSE_FRAME);
        }
        self.teardown(reason, transport, handler)
    }

    fn handle_handshake<T: Transport, H: Handler>(
        &mut self,
        data: &[u8],
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        let status = match self.handshake.as_mut() {
            Some(collector) => collector.feed(data),
            None => return ProcessResult::Stale,
        };

        let (key, consumed) = match status {
            Ok(HandshakeStatus::Collecting) => return ProcessResult::Continue,
            Ok(HandshakeStatus::Complete { key, consumed }) => (key, consumed),
            Err(HandshakeError::Resource(e)) => {
                return self.teardown(CloseReason::Resource(e), transport, handler);
            }
            Err(e) => return self.teardown(CloseReason::Handshake(e), transport, handler),
        };

        // The request buffer is released whatever happens next.
        self.handshake = None;

        let response = handshake::response(&handshake::accept_token(&key));
        if let Err(e) = write_all(transport, response.as_bytes()) {
            return self.teardown(CloseReason::Transport(e.kind()), transport, handler);
        }

        let rest = &data[consumed..];
        if transport.has_pending_output() {
            self.phase = Phase::Upgrading;
            trace!(conn_id = self.id, "handshake response pending flush");
            return self.stash(rest, transport, handler);
        }
        self.open(rest, transport, handler)
    }

    fn stash<T: Transport, H: Handler>(
        &mut self,
        data: &[u8],
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        match self.early.append(data) {
            Ok(()) => ProcessResult::Continue,
            Err(e) => self.teardown(CloseReason::Resource(e), transport, handler),
        }
    }

    /// The response is on the wire: run `on_connect`, then `rest` as frames.
    fn open<T: Transport, H: Handler>(
        &mut self,
        rest: &[u8],
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        self.phase = Phase::Open;
        self.connected = true;
        debug!(conn_id = self.id, "handshake complete");

        let mut session = Session::new(self.id, transport);
        handler.on_connect(&mut session);
        if let Some(result) = self.after_callback(&session) {
            drop(session);
            return self.finish_callback(result, transport, handler);
        }
        drop(session);

        if rest.is_empty() {
            ProcessResult::Continue
        } else {
            self.handle_frames(rest, transport, handler)
        }
    }

    fn handle_frames<T: Transport, H: Handler>(
        &mut self,
        data: &[u8],
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        debug_assert!(self.handshake.is_none());

        let mut offset = 0;
        while offset < data.len() {
            match self.assembler.feed(&data[offset..]) {
                Ok(Step::Incomplete) => break,
                Ok(Step::Complete { frame, consumed }) => {
                    offset += consumed;
                    trace!(
                        conn_id = self.id,
                        opcode = ?frame.opcode(),
                        fin = frame.fin(),
                        len = frame.payload_len(),
                        "frame complete"
                    );
                    if let Some(result) = self.handle_frame(frame, transport, handler) {
                        return result;
                    }
                }
                Err(FrameError::Protocol(e)) => {
                    return self.fail(CloseReason::Protocol(e), transport, handler);
                }
                Err(FrameError::Resource(e)) => {
                    return self.fail(CloseReason::Resource(e), transport, handler);
                }
            }
        }
        ProcessResult::Continue
    }

    /// Route one completed frame. Returns `Some` if the connection closed.
    fn handle_frame<T: Transport, H: Handler>(
        &mut self,
        mut frame: Frame,
        transport: &mut T,
        handler: &mut H,
    ) -> Option<ProcessResult> {
        if frame.opcode().is_control() {
            return match control_action(&mut frame) {
                Ok(ControlAction::Reply(reply)) => write_all(transport, &reply)
                    .err()
                    .map(|e| self.teardown(CloseReason::Transport(e.kind()), transport, handler)),
                Ok(ControlAction::Ignore) => None,
                Ok(ControlAction::Close(reply)) => {
                    self.phase = Phase::Closing;
                    let _ = write_all(transport, &reply);
                    Some(self.teardown(CloseReason::CloseFrame, transport, handler))
                }
                Err(e) => Some(self.fail(CloseReason::Protocol(e), transport, handler)),
            };
        }

        let message = match self.chain.push(frame) {
            Ok(None) => return None,
            Ok(Some(message)) => message,
            Err(FrameError::Protocol(e)) => {
                return Some(self.fail(CloseReason::Protocol(e), transport, handler));
            }
            Err(FrameError::Resource(e)) => {
                return Some(self.fail(CloseReason::Resource(e), transport, handler));
            }
        };

        let mut session = Session::new(self.id, transport);
        handler.on_message(&mut session, &message);
        drop(message);
        let result = self.after_callback(&session);
        drop(session);
        result.map(|reason| self.finish_callback(reason, transport, handler))
    }

    /// Inspect what the handler did with its session.
    fn after_callback(&self, session: &Session<'_>) -> Option<CloseReason> {
        if let Some(kind) = session.failure() {
            Some(CloseReason::Transport(kind))
        } else if session.close_requested() {
            Some(CloseReason::LocalClose)
        } else {
            None
        }
    }

    fn finish_callback<T: Transport, H: Handler>(
        &mut self,
        reason: CloseReason,
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        if reason == CloseReason::LocalClose {
            self.phase = Phase::Closing;
        }
        self.teardown(reason, transport, handler)
    }

    /// Release everything exactly once. Later calls are no-ops.
    fn teardown<T: Transport, H: Handler>(
        &mut self,
        reason: CloseReason,
        transport: &mut T,
        handler: &mut H,
    ) -> ProcessResult {
        if self.phase == Phase::Closed {
            return ProcessResult::Stale;
        }
        self.phase = Phase::Closed;
        transport.shutdown();

        if std::mem::take(&mut self.connected) {
            handler.on_close(self.id);
        }

        self.handshake = None;
        self.assembler.reset();
        self.chain.clear();
        self.early.clear();

        if reason.is_resource() {
            warn!(conn_id = self.id, %reason, "connection failed");
        } else {
            debug!(conn_id = self.id, %reason, "connection closed");
        }
        ProcessResult::Closed(reason)
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<T> {
    connections: Slab<T>,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert an entry built from its own id.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert_with(&mut self, build: impl FnOnce(usize) -> T) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        entry.insert(build(id));
        Some(id)
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.connections.get_mut(id)
    }

    /// Remove an entry. Removing twice is harmless.
    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
