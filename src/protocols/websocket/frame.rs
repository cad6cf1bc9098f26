//! WebSocket frame representation, masking, and encoding.

use super::MAX_HEADER_LEN;
use crate::runtime::buffer::{BufferError, ByteBuffer};
use bytes::{BufMut, BytesMut};

/// Minimal close frame sent when failing a connection.
pub const CLOSE_FRAME: [u8; 2] = [0x88, 0x00];

/// WebSocket opcodes (RFC 6455 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame (0x0)
    Continuation = 0x0,
    /// Text data frame (0x1)
    Text = 0x1,
    /// Binary data frame (0x2)
    Binary = 0x2,
    /// Connection close frame (0x8)
    Close = 0x8,
    /// Ping frame (0x9)
    Ping = 0x9,
    /// Pong frame (0xA)
    Pong = 0xA,
}

impl Opcode {
    /// Parse the low nibble of the first header byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control opcodes have the high bit of the nibble set.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

/// XOR `payload` with the 4-byte masking key.
///
/// Masking and unmasking are the same operation.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Append one encoded frame to `buf`.
///
/// Server frames go out unmasked (`mask = None`); a key may be supplied to
/// produce client-style frames.
pub fn encode_frame(
    buf: &mut BytesMut,
    fin: bool,
    opcode: Opcode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) {
    buf.reserve(MAX_HEADER_LEN + payload.len());

    let fin_bit = if fin { 0x80 } else { 0x00 };
    buf.put_u8(fin_bit | opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    match payload.len() {
        len if len < 126 => buf.put_u8(mask_bit | len as u8),
        len if len <= u16::MAX as usize => {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len as u16);
        }
        len => {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(len as u64);
        }
    }

    match mask {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.put_slice(payload),
    }
}

/// One frame being decoded, or fully decoded.
///
/// The header and the (still masked) payload are kept together in `raw`;
/// `payload_offset` points just past the masking key once the header is known.
#[derive(Debug)]
pub struct Frame {
    pub(crate) fin: bool,
    pub(crate) opcode: Opcode,
    pub(crate) masked: bool,
    pub(crate) mask_key: [u8; 4],
    /// `None` until the length field has been decoded.
    pub(crate) payload_len: Option<u64>,
    /// Header length, known once byte 1 has arrived.
    pub(crate) header_len: Option<usize>,
    pub(crate) payload_offset: usize,
    pub(crate) raw: ByteBuffer,
}

impl Frame {
    /// Open a new frame with one chunk of raw storage.
    pub(crate) fn open(chunk_size: usize, raw_limit: usize) -> Result<Self, BufferError> {
        let mut raw = ByteBuffer::new(chunk_size, raw_limit);
        raw.capacity_for(chunk_size.min(raw_limit))?;
        Ok(Self {
            fin: false,
            opcode: Opcode::Continuation,
            masked: false,
            mask_key: [0; 4],
            payload_len: None,
            header_len: None,
            payload_offset: 0,
            raw,
        })
    }

    pub fn fin(&self) -> bool {
        self.fin
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn mask_key(&self) -> [u8; 4] {
        self.mask_key
    }

    /// Decoded payload length, zero while unknown.
    pub fn payload_len(&self) -> u64 {
        self.payload_len.unwrap_or(0)
    }

    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    /// Unmask the payload in place and return it.
    ///
    /// Must only be called once per frame.
    pub fn unmask(&mut self) -> &[u8] {
        let start = self.payload_offset.min(self.raw.len());
        let key = self.mask_key;
        let masked = self.masked;
        let payload = &mut self.raw.as_mut_slice()[start..];
        if masked {
            apply_mask(payload, key);
        }
        payload
    }
}
