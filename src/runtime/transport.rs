//! Byte-out side of a connection.
//!
//! The protocol core only ever writes through `Transport`; reading is done by
//! the driver, which hands the bytes to `Connection::on_data`.

use bytes::{Buf, BytesMut};
use std::io::{self, Write};

/// Write capability of one connection.
pub trait Transport {
    /// Write some prefix of `buf`, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// True while accepted bytes have not reached the peer's socket yet.
    fn has_pending_output(&self) -> bool {
        false
    }

    /// Stop accepting further output. Called once during teardown.
    fn shutdown(&mut self) {}
}

/// Write the whole buffer, retrying partial writes from the unwritten offset.
///
/// A write that accepts zero bytes is treated as fatal.
pub fn write_all<T: Transport + ?Sized>(transport: &mut T, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match transport.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "transport accepted zero bytes",
                ));
            }
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Staging buffer: output is collected and flushed by the caller.
impl Transport for BytesMut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn has_pending_output(&self) -> bool {
        !self.is_empty()
    }
}

impl Transport for Vec<u8> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn has_pending_output(&self) -> bool {
        !self.is_empty()
    }
}

/// Non-blocking stream with a bounded backlog for writes that would block.
///
/// Bytes the socket will not take right now are parked and flushed, in
/// order, when the socket becomes writable again. Once anything is parked,
/// later writes queue behind it.
#[derive(Debug)]
pub struct BufferedStream<S> {
    inner: S,
    backlog: BytesMut,
    max_backlog: usize,
    shut: bool,
}

impl<S: Write> BufferedStream<S> {
    pub fn new(inner: S, max_backlog: usize) -> Self {
        Self {
            inner,
            backlog: BytesMut::new(),
            max_backlog,
            shut: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// True if parked bytes are waiting for writability.
    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// True once `shutdown` has been called.
    pub fn is_shut(&self) -> bool {
        self.shut
    }

    /// Write parked bytes. Returns `true` once the backlog is empty.
    pub fn flush_backlog(&mut self) -> io::Result<bool> {
        while !self.backlog.is_empty() {
            match self.inner.write(&self.backlog) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.backlog.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn park(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.backlog.len() + buf.len() > self.max_backlog {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "write backlog limit exceeded",
            ));
        }
        self.backlog.extend_from_slice(buf);
        Ok(buf.len())
    }
}

impl<S: Write> Transport for BufferedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.shut {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport shut down"));
        }
        if self.has_backlog() {
            return self.park(buf);
        }
        match self.inner.write(buf) {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => self.park(buf),
            other => other,
        }
    }

    fn has_pending_output(&self) -> bool {
        self.has_backlog()
    }

    fn shutdown(&mut self) {
        self.shut = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts at most `per_call` bytes, then blocks after `budget`.
    struct Trickle {
        written: Vec<u8>,
        per_call: usize,
        budget: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.per_call).min(self.budget);
            self.written.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Transport for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_write_all_retries_partial_writes() {
        let mut stream = BufferedStream::new(
            Trickle {
                written: Vec::new(),
                per_call: 3,
                budget: usize::MAX,
            },
            1024,
        );
        write_all(&mut stream, b"hello world").unwrap();
        assert_eq!(stream.get_ref().written, b"hello world");
        assert!(!stream.has_backlog());
    }

    #[test]
    fn test_write_all_zero_is_fatal() {
        let err = write_all(&mut ZeroWriter, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_would_block_parks_then_flushes_in_order() {
        let mut stream = BufferedStream::new(
            Trickle {
                written: Vec::new(),
                per_call: 100,
                budget: 4,
            },
            1024,
        );

        write_all(&mut stream, b"abcdefgh").unwrap();
        write_all(&mut stream, b"ijk").unwrap();
        assert_eq!(stream.get_ref().written, b"abcd");
        assert_eq!(stream.backlog_len(), 7);
        assert!(stream.has_pending_output());

        stream.get_mut().budget = usize::MAX;
        assert!(stream.flush_backlog().unwrap());
        assert_eq!(stream.get_ref().written, b"abcdefghijk");
        assert!(!stream.has_pending_output());
    }

    #[test]
    fn test_backlog_limit() {
        let mut stream = BufferedStream::new(
            Trickle {
                written: Vec::new(),
                per_call: 100,
                budget: 0,
            },
            4,
        );
        assert!(write_all(&mut stream, b"abcd").is_ok());
        assert!(write_all(&mut stream, b"e").is_err());
    }

    #[test]
    fn test_staging_buffer_reports_pending_output() {
        let mut staged = BytesMut::new();
        assert!(!staged.has_pending_output());
        write_all(&mut staged, b"101").unwrap();
        assert!(staged.has_pending_output());
        staged.clear();
        assert!(!staged.has_pending_output());
    }

    #[test]
    fn test_writes_after_shutdown_fail() {
        let mut stream = BufferedStream::new(Vec::new(), 1024);
        stream.shutdown();
        assert!(stream.is_shut());
        assert!(write_all(&mut stream, b"late").is_err());
    }
}
