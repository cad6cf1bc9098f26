//! Message reassembly and control frame handling.
//!
//! Data frames of one logical message are collected in a `FragmentChain`
//! until the final (`FIN`) frame arrives; the chain is then drained into a
//! single unmasked `Message`. Control frames never enter the chain.

use super::frame::{encode_frame, Frame, Opcode};
use super::parser::FrameError;
use super::ProtocolError;
use crate::runtime::buffer::BufferError;
use bytes::BytesMut;

/// A fully reassembled, unmasked application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    opcode: Opcode,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Opcode of the frame that started the message (text or binary).
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Frames of the message currently being received, in arrival order.
#[derive(Debug)]
pub struct FragmentChain {
    frames: Vec<Frame>,
    total_len: u64,
    max_message_size: usize,
}

impl FragmentChain {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            frames: Vec::new(),
            total_len: 0,
            max_message_size,
        }
    }

    /// Number of frames held.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when no fragmented message is in progress.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sum of payload lengths held so far.
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Drop every held frame.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.total_len = 0;
    }

    /// Add a completed data frame.
    ///
    /// Returns the reassembled message when `frame` is the final fragment.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, FrameError> {
        debug_assert!(!frame.opcode().is_control());

        match (self.frames.is_empty(), frame.opcode()) {
            (true, Opcode::Continuation) => {
                return Err(ProtocolError::UnexpectedContinuation.into());
            }
            (false, op) if op != Opcode::Continuation => {
                return Err(ProtocolError::InterleavedDataFrame.into());
            }
            _ => {}
        }

        let total = self.total_len.saturating_add(frame.payload_len());
        if total > self.max_message_size as u64 {
            return Err(ProtocolError::MessageTooLarge {
                len: total,
                limit: self.max_message_size,
            }
            .into());
        }

        let fin = frame.fin();
        self.total_len = total;
        self.frames.push(frame);

        if !fin {
            return Ok(None);
        }
        self.assemble().map(Some).map_err(FrameError::Resource)
    }

    /// Drain the chain into one contiguous, unmasked message.
    fn assemble(&mut self) -> Result<Message, BufferError> {
        let total = self.total_len as usize;
        let opcode = self.frames[0].opcode();

        let mut payload = Vec::new();
        let reserved = payload.try_reserve_exact(total);
        if reserved.is_err() {
            self.clear();
            return Err(BufferError::AllocFailed { requested: total });
        }

        for mut frame in self.frames.drain(..) {
            payload.extend_from_slice(frame.unmask());
        }
        self.total_len = 0;

        Ok(Message::new(opcode, payload))
    }
}

/// What to do in response to a control frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ControlAction {
    /// Write these bytes back (pong for a ping).
    Reply(BytesMut),
    /// Nothing to do (unsolicited pong).
    Ignore,
    /// Peer started the closing handshake: write the reply, then tear down.
    Close(BytesMut),
}

/// Decide how to answer a completed control frame.
pub fn control_action(frame: &mut Frame) -> Result<ControlAction, ProtocolError> {
    let opcode = frame.opcode();
    let payload = frame.unmask();

    match opcode {
        Opcode::Ping => {
            let mut reply = BytesMut::new();
            encode_frame(&mut reply, true, Opcode::Pong, payload, None);
            Ok(ControlAction::Reply(reply))
        }
        Opcode::Pong => Ok(ControlAction::Ignore),
        Opcode::Close => {
            if payload.len() == 1 {
                return Err(ProtocolError::InvalidClosePayload);
            }
            // Echo the status code, if any.
            let status = &payload[..payload.len().min(2)];
            let mut reply = BytesMut::new();
            encode_frame(&mut reply, true, Opcode::Close, status, None);
            Ok(ControlAction::Close(reply))
        }
        other => Err(ProtocolError::InvalidOpcode(other.as_u8())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::websocket::parser::{FrameAssembler, Step};
    use crate::protocols::websocket::Limits;

    const KEY: [u8; 4] = [1, 2, 3, 4];

    fn frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Frame {
        let mut bytes = BytesMut::new();
        encode_frame(&mut bytes, fin, opcode, payload, Some(KEY));
        let mut asm = FrameAssembler::new(&Limits::default());
        match asm.feed(&bytes).unwrap() {
            Step::Complete { frame, .. } => frame,
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_single_frame_message() {
        let mut chain = FragmentChain::new(1024);
        let msg = chain
            .push(frame(true, Opcode::Text, b"hello"))
            .unwrap()
            .unwrap();
        assert_eq!(msg.opcode(), Opcode::Text);
        assert_eq!(msg.payload(), b"hello");
        assert!(chain.is_empty());
    }

    #[test]
    fn test_fragmented_message_inherits_first_opcode() {
        let mut chain = FragmentChain::new(1024);
        assert!(chain
            .push(frame(false, Opcode::Binary, &[1, 2]))
            .unwrap()
            .is_none());
        assert!(chain
            .push(frame(false, Opcode::Continuation, &[3]))
            .unwrap()
            .is_none());
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.total_len(), 3);

        let msg = chain
            .push(frame(true, Opcode::Continuation, &[4, 5, 6]))
            .unwrap()
            .unwrap();
        assert_eq!(msg.opcode(), Opcode::Binary);
        assert_eq!(msg.payload(), &[1, 2, 3, 4, 5, 6]);
        assert!(chain.is_empty());
        assert_eq!(chain.total_len(), 0);
    }

    #[test]
    fn test_continuation_without_start() {
        let mut chain = FragmentChain::new(1024);
        let err = chain
            .push(frame(true, Opcode::Continuation, b"x"))
            .unwrap_err();
        assert_eq!(
            err,
            FrameError::Protocol(ProtocolError::UnexpectedContinuation)
        );
    }

    #[test]
    fn test_interleaved_data_frame() {
        let mut chain = FragmentChain::new(1024);
        chain.push(frame(false, Opcode::Text, b"a")).unwrap();
        let err = chain.push(frame(true, Opcode::Text, b"b")).unwrap_err();
        assert_eq!(err, FrameError::Protocol(ProtocolError::InterleavedDataFrame));
    }

    #[test]
    fn test_message_size_limit() {
        let mut chain = FragmentChain::new(4);
        chain.push(frame(false, Opcode::Binary, &[0; 3])).unwrap();
        let err = chain
            .push(frame(true, Opcode::Continuation, &[0; 2]))
            .unwrap_err();
        assert_eq!(
            err,
            FrameError::Protocol(ProtocolError::MessageTooLarge { len: 5, limit: 4 })
        );
    }

    #[test]
    fn test_ping_gets_pong_with_same_payload() {
        let mut ping = frame(true, Opcode::Ping, b"are you there");
        match control_action(&mut ping).unwrap() {
            ControlAction::Reply(bytes) => {
                assert_eq!(bytes[0], 0x8A);
                assert_eq!(bytes[1], 13);
                assert_eq!(&bytes[2..], b"are you there");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_pong_ignored() {
        let mut pong = frame(true, Opcode::Pong, b"");
        assert_eq!(control_action(&mut pong).unwrap(), ControlAction::Ignore);
    }

    #[test]
    fn test_close_echoes_status() {
        let mut close = frame(true, Opcode::Close, &[0x03, 0xE8, b'b', b'y', b'e']);
        match control_action(&mut close).unwrap() {
            ControlAction::Close(bytes) => assert_eq!(&bytes[..], &[0x88, 0x02, 0x03, 0xE8]),
            other => panic!("unexpected: {:?}", other),
        }

        let mut empty = frame(true, Opcode::Close, b"");
        assert_eq!(
            control_action(&mut empty).unwrap(),
            ControlAction::Close(BytesMut::from(&[0x88u8, 0x00][..]))
        );
    }

    #[test]
    fn test_close_with_one_byte_rejected() {
        let mut close = frame(true, Opcode::Close, &[0x03]);
        assert_eq!(
            control_action(&mut close).unwrap_err(),
            ProtocolError::InvalidClosePayload
        );
    }
}
