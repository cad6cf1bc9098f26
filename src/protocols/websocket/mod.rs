//! WebSocket protocol (RFC 6455), server side.
//!
//! Everything in this module is sans-IO: it consumes byte slices and writes
//! through the `Transport` trait, so the same code runs under the mio event
//! loop, the tokio server, and unit tests.
//!
//! ## Pipeline
//!
//! ```text
//! bytes ──► HandshakeCollector ──► 101 response, on_connect
//!                 │ (after upgrade)
//!                 ▼
//!           FrameAssembler ──► control frame ──► ping/pong/close handling
//!                 │
//!                 ▼
//!           FragmentChain ──► Message ──► on_message
//! ```
//!
//! ## Wire format
//!
//! ```text
//! byte 0: FIN | RSV1 | RSV2 | RSV3 | opcode(4)
//! byte 1: MASK | payload len(7)
//! [2 or 8 bytes extended length if len == 126 / 127]
//! [4 bytes masking key if MASK]
//! payload
//! ```

pub mod frame;
pub mod handler;
pub mod handshake;
pub mod message;
pub mod parser;

pub use frame::{apply_mask, encode_frame, Frame, Opcode};
pub use handler::{Handler, Session};
pub use handshake::{accept_token, HandshakeCollector, HandshakeError, HandshakeStatus};
pub use message::{ControlAction, FragmentChain, Message};
pub use parser::{FrameAssembler, FrameError, Step};

use crate::runtime::buffer::DEFAULT_CHUNK_SIZE;
use std::fmt;

/// Largest possible frame header: 2 + 8 (extended length) + 4 (mask key).
pub const MAX_HEADER_LEN: usize = 14;

/// Control frame payloads are capped by the protocol.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Size bounds applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Growth increment for handshake and frame buffers.
    pub chunk_size: usize,
    /// Maximum size of the opening handshake request.
    pub max_handshake_size: usize,
    /// Maximum payload of a single frame.
    pub max_frame_size: usize,
    /// Maximum total payload of a (possibly fragmented) message.
    pub max_message_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_handshake_size: 8 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

/// Violations of the framing rules. Any of these fails the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// RSV bits set without a negotiated extension.
    ReservedBits(u8),
    /// Opcode outside the defined set.
    InvalidOpcode(u8),
    /// Client frame without the MASK bit.
    UnmaskedFrame,
    /// Control frame with FIN = 0.
    FragmentedControl,
    /// Control frame payload above 125 bytes.
    ControlTooLarge(u64),
    /// 64-bit length with the most significant bit set.
    InvalidLength,
    /// Single frame payload above the configured maximum.
    FrameTooLarge { len: u64, limit: usize },
    /// Reassembled message above the configured maximum.
    MessageTooLarge { len: u64, limit: usize },
    /// Continuation frame with no message in progress.
    UnexpectedContinuation,
    /// New text/binary frame while a fragmented message is in progress.
    InterleavedDataFrame,
    /// Close frame carrying a 1-byte payload.
    InvalidClosePayload,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::ReservedBits(bits) => write!(f, "reserved bits set: {bits:#04x}"),
            ProtocolError::InvalidOpcode(op) => write!(f, "invalid opcode: {op:#x}"),
            ProtocolError::UnmaskedFrame => write!(f, "client frame is not masked"),
            ProtocolError::FragmentedControl => write!(f, "control frame is fragmented"),
            ProtocolError::ControlTooLarge(len) => {
                write!(f, "control frame payload too large: {len} > {MAX_CONTROL_PAYLOAD}")
            }
            ProtocolError::InvalidLength => write!(f, "invalid 64-bit payload length"),
            ProtocolError::FrameTooLarge { len, limit } => {
                write!(f, "frame too large: {len} > {limit}")
            }
            ProtocolError::MessageTooLarge { len, limit } => {
                write!(f, "message too large: {len} > {limit}")
            }
            ProtocolError::UnexpectedContinuation => {
                write!(f, "continuation frame without a message in progress")
            }
            ProtocolError::InterleavedDataFrame => {
                write!(f, "data frame received while a fragmented message is in progress")
            }
            ProtocolError::InvalidClosePayload => write!(f, "close frame payload of 1 byte"),
        }
    }
}

impl std::error::Error for ProtocolError {}
