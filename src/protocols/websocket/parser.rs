//! Incremental frame assembler.
//!
//! Header bytes are decoded one at a time as they arrive, so a frame may be
//! split across any number of reads. Once the header is complete, payload
//! bytes are copied in bulk up to the decoded length. Completion boundaries
//! are identical to feeding the stream one byte at a time.

use super::frame::{Frame, Opcode};
use super::{Limits, ProtocolError, MAX_CONTROL_PAYLOAD, MAX_HEADER_LEN};
use crate::runtime::buffer::BufferError;
use std::fmt;

/// Failure while assembling a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The peer broke the framing rules.
    Protocol(ProtocolError),
    /// The connection could not obtain memory for the frame.
    Resource(BufferError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Protocol(e) => write!(f, "protocol error: {e}"),
            FrameError::Resource(e) => write!(f, "resource error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<ProtocolError> for FrameError {
    fn from(e: ProtocolError) -> Self {
        FrameError::Protocol(e)
    }
}

impl From<BufferError> for FrameError {
    fn from(e: BufferError) -> Self {
        FrameError::Resource(e)
    }
}

/// Outcome of feeding bytes to the assembler.
#[derive(Debug)]
pub enum Step {
    /// All input consumed; the open frame still needs more bytes.
    Incomplete,
    /// A frame completed after `consumed` bytes of the input.
    Complete { frame: Frame, consumed: usize },
}

/// Owns the connection's in-progress frame.
#[derive(Debug)]
pub struct FrameAssembler {
    pending: Option<Frame>,
    chunk_size: usize,
    max_frame_size: usize,
}

impl FrameAssembler {
    pub fn new(limits: &Limits) -> Self {
        Self {
            pending: None,
            chunk_size: limits.chunk_size,
            max_frame_size: limits.max_frame_size,
        }
    }

    /// True when no frame is partially received.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// The partially received frame, if any.
    pub fn pending(&self) -> Option<&Frame> {
        self.pending.as_ref()
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Feed bytes until one frame completes or the input runs out.
    ///
    /// On `Complete`, bytes after `consumed` belong to the next frame and
    /// must be fed again. On error the pending frame is discarded.
    pub fn feed(&mut self, data: &[u8]) -> Result<Step, FrameError> {
        let result = self.feed_inner(data);
        if result.is_err() {
            self.pending = None;
        }
        result
    }

    fn feed_inner(&mut self, data: &[u8]) -> Result<Step, FrameError> {
        let mut offset = 0;

        while offset < data.len() {
            if self.pending.is_none() {
                let raw_limit = self.max_frame_size.saturating_add(MAX_HEADER_LEN);
                self.pending = Some(Frame::open(self.chunk_size, raw_limit)?);
            }
            let Some(frame) = self.pending.as_mut() else {
                break;
            };

            match frame.payload_len {
                Some(len) if frame.payload_offset > 0 => {
                    // Header done: copy as much payload as is available.
                    let have = (frame.raw.len() - frame.payload_offset) as u64;
                    let want = (len - have) as usize;
                    let take = want.min(data.len() - offset);
                    // Grows chunk by chunk with what actually arrived.
                    frame.raw.append(&data[offset..offset + take])?;
                    offset += take;
                }
                _ => {
                    frame.raw.push(data[offset])?;
                    offset += 1;
                    decode_header(frame, self.max_frame_size)?;
                }
            }

            if is_complete(frame) {
                if let Some(frame) = self.pending.take() {
                    return Ok(Step::Complete {
                        frame,
                        consumed: offset,
                    });
                }
            }
        }

        Ok(Step::Incomplete)
    }
}

/// True once the header is decoded and the whole payload has arrived.
fn is_complete(frame: &Frame) -> bool {
    match frame.payload_len {
        Some(len) if frame.payload_offset > 0 => {
            (frame.raw.len() - frame.payload_offset) as u64 == len
        }
        _ => false,
    }
}

/// Decode whatever header field the most recent byte completed.
fn decode_header(frame: &mut Frame, max_frame_size: usize) -> Result<(), ProtocolError> {
    let raw = frame.raw.as_slice();
    let n = raw.len();

    if n == 1 {
        let b0 = raw[0];
        let rsv = b0 & 0x70;
        if rsv != 0 {
            return Err(ProtocolError::ReservedBits(rsv));
        }
        let opcode = Opcode::from_u8(b0 & 0x0F).ok_or(ProtocolError::InvalidOpcode(b0 & 0x0F))?;
        frame.fin = b0 & 0x80 != 0;
        frame.opcode = opcode;
        if opcode.is_control() && !frame.fin {
            return Err(ProtocolError::FragmentedControl);
        }
        return Ok(());
    }

    if n == 2 {
        let b1 = raw[1];
        frame.masked = b1 & 0x80 != 0;
        if !frame.masked {
            return Err(ProtocolError::UnmaskedFrame);
        }
        let len7 = (b1 & 0x7F) as u64;
        if frame.opcode.is_control() && len7 > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlTooLarge(len7));
        }
        let ext_len = match len7 {
            126 => 2,
            127 => 8,
            _ => {
                set_payload_len(frame, len7, max_frame_size)?;
                0
            }
        };
        frame.header_len = Some(2 + ext_len + 4);
        return Ok(());
    }

    let header_len = match frame.header_len {
        Some(h) => h,
        None => return Ok(()),
    };
    let ext_end = header_len - 4;

    if n == ext_end {
        let len = if ext_end == 4 {
            u16::from_be_bytes([raw[2], raw[3]]) as u64
        } else {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&raw[2..10]);
            u64::from_be_bytes(bytes)
        };
        if len & (1 << 63) != 0 {
            return Err(ProtocolError::InvalidLength);
        }
        set_payload_len(frame, len, max_frame_size)?;
    } else if n == header_len {
        frame.mask_key.copy_from_slice(&raw[ext_end..header_len]);
        frame.payload_offset = header_len;
    }

    Ok(())
}

fn set_payload_len(frame: &mut Frame, len: u64, max_frame_size: usize) -> Result<(), ProtocolError> {
    if len > max_frame_size as u64 {
        return Err(ProtocolError::FrameTooLarge {
            len,
            limit: max_frame_size,
        });
    }
    frame.payload_len = Some(len);
    Ok(())
}
