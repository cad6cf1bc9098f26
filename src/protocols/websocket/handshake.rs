//! Opening handshake.
//!
//! Collects the HTTP upgrade request until the blank line that ends the
//! header block, extracts `Sec-WebSocket-Key`, and builds the
//! `101 Switching Protocols` response.

use super::Limits;
use crate::runtime::buffer::{BufferError, ByteBuffer};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use std::fmt;

/// GUID appended to the client key before hashing (RFC 6455 Section 1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header name, compared case-insensitively.
const KEY_HEADER: &[u8] = b"sec-websocket-key:";

/// Longest terminator minus one; the overlap rescanned on each feed.
const TERMINATOR_OVERLAP: usize = 3;

/// Errors that abort the handshake. The connection is closed silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Request exceeded the configured maximum without a terminator.
    TooLarge { limit: usize },
    /// No (or an empty) `Sec-WebSocket-Key` header.
    MissingKey,
    /// Key header is not valid UTF-8.
    InvalidKey,
    /// Buffer allocation failed.
    Resource(BufferError),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::TooLarge { limit } => {
                write!(f, "handshake request exceeds {limit} bytes")
            }
            HandshakeError::MissingKey => write!(f, "missing Sec-WebSocket-Key header"),
            HandshakeError::InvalidKey => write!(f, "Sec-WebSocket-Key is not valid UTF-8"),
            HandshakeError::Resource(e) => write!(f, "handshake buffer: {e}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Result of feeding bytes to the collector.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Terminator not seen yet.
    Collecting,
    /// Header block complete. `consumed` bytes of the last chunk belonged to
    /// the request; anything after that is WebSocket data.
    Complete { key: String, consumed: usize },
}

/// Accumulates the upgrade request.
#[derive(Debug)]
pub struct HandshakeCollector {
    buffer: ByteBuffer,
}

impl HandshakeCollector {
    pub fn new(limits: &Limits) -> Self {
        Self {
            buffer: ByteBuffer::new(limits.chunk_size, limits.max_handshake_size),
        }
    }

    /// Bytes collected so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append a chunk and look for the end of the header block.
    pub fn feed(&mut self, data: &[u8]) -> Result<HandshakeStatus, HandshakeError> {
        let start = self.buffer.len();
        let take = data.len().min(self.buffer.remaining());

        self.buffer.append(&data[..take]).map_err(HandshakeError::Resource)?;

        let scan_from = start.saturating_sub(TERMINATOR_OVERLAP);
        if let Some(end) = find_terminator(self.buffer.as_slice(), scan_from) {
            let key = extract_key(&self.buffer.as_slice()[..end])?;
            return Ok(HandshakeStatus::Complete {
                key,
                consumed: end - start,
            });
        }

        if take < data.len() {
            return Err(HandshakeError::TooLarge {
                limit: self.buffer.limit(),
            });
        }
        Ok(HandshakeStatus::Collecting)
    }
}

/// Find the end (exclusive) of the first `\r\n\r\n` or `\n\n` at or after `from`.
pub fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(b"\r\n\r\n") {
            Some(i + 4)
        } else if rest.starts_with(b"\n\n") {
            Some(i + 2)
        } else {
            None
        }
    })
}

/// Locate the `Sec-WebSocket-Key` value in a raw header block.
///
/// Lines may be separated by `\r`, `\n`, or both. Surrounding spaces and
/// tabs are stripped; inner whitespace is kept.
pub fn extract_key(headers: &[u8]) -> Result<String, HandshakeError> {
    let value = headers
        .split(|&b| b == b'\r' || b == b'\n')
        .filter(|line| !line.is_empty())
        .find_map(|line| {
            let name = line.get(..KEY_HEADER.len())?;
            name.eq_ignore_ascii_case(KEY_HEADER)
                .then(|| &line[KEY_HEADER.len()..])
        })
        .ok_or(HandshakeError::MissingKey)?;

    let value = std::str::from_utf8(value).map_err(|_| HandshakeError::InvalidKey)?;
    let key = value.trim_matches(|c| c == ' ' || c == '\t');
    if key.is_empty() {
        return Err(HandshakeError::MissingKey);
    }
    Ok(key.to_string())
}

/// Derive `Sec-WebSocket-Accept` from the client key.
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The complete `101 Switching Protocols` response.
pub fn response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
}
