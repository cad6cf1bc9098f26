//! Tokio server: one task per connection.
//!
//! The protocol core is synchronous, so each connection stages its output in a
//! `BytesMut` while the core runs and then writes it to the socket.

use crate::config::Config;
use crate::protocols::websocket::{Handler, Limits};
use crate::runtime::{CloseReason, Connection, Phase, ProcessResult};
use bytes::BytesMut;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Server instance
pub struct Server<F> {
    config: Config,
    make_handler: F,
    connection_limit: Arc<Semaphore>,
    next_id: AtomicUsize,
}

impl<F, H> Server<F>
where
    F: Fn() -> H,
    H: Handler + Send + 'static,
{
    /// Create a new server instance. `make_handler` is called once per
    /// accepted connection.
    pub fn new(config: Config, make_handler: F) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            make_handler,
            connection_limit,
            next_id: AtomicUsize::new(0),
        }
    }

    /// Start the server and begin accepting connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    debug!(conn_id, peer = %addr, "New connection");

                    let limits = self.config.limits();
                    let read_buffer_size = self.config.read_buffer_size;
                    let handler = (self.make_handler)();

                    tokio::spawn(async move {
                        match handle_connection(stream, conn_id, limits, read_buffer_size, handler)
                            .await
                        {
                            Ok(reason) => debug!(conn_id, %reason, "Connection finished"),
                            Err(e) => debug!(conn_id, error = %e, "Connection error"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Drive one connection until the core tears it down.
pub async fn handle_connection<S, H>(
    mut stream: S,
    conn_id: usize,
    limits: Limits,
    read_buffer_size: usize,
    mut handler: H,
) -> io::Result<CloseReason>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
{
    let mut conn = Connection::new(conn_id, &limits);
    let mut input = BytesMut::with_capacity(read_buffer_size);
    let mut output = BytesMut::new();

    loop {
        input.clear();
        input.reserve(read_buffer_size);

        let mut result = match stream.read_buf(&mut input).await {
            Ok(0) => conn.on_eof(&mut output, &mut handler),
            Ok(_) => conn.on_data(&input, &mut output, &mut handler),
            Err(e) => conn.on_transport_error(e.kind(), &mut output, &mut handler),
        };

        loop {
            if !output.is_empty() {
                let written = stream.write_all(&output).await;
                output.clear();
                if let Err(e) = written {
                    // Still open means the core has not heard about this yet.
                    if let ProcessResult::Closed(reason) =
                        conn.on_transport_error(e.kind(), &mut output, &mut handler)
                    {
                        return Ok(reason);
                    }
                    break;
                }
            }
            if conn.phase() != Phase::Upgrading {
                break;
            }
            // The 101 response is on the socket; the handler may now run.
            result = conn.on_flushed(&mut output, &mut handler);
        }

        match result {
            ProcessResult::Continue => {}
            ProcessResult::Closed(reason) => {
                let _ = stream.shutdown().await;
                return Ok(reason);
            }
            ProcessResult::Stale => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connection already closed",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::websocket::{encode_frame, Message, Opcode, Session};
    use std::cell::RefCell;
    use std::rc::Rc;
    use tokio_test::io::Builder;

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    const RESPONSE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

    struct Echo;

    impl Handler for Echo {
        fn on_message(&mut self, session: &mut Session<'_>, message: &Message) {
            let _ = session.send(message.opcode(), message.payload());
        }
    }

    /// Records sink calls into a log shared with the test.
    #[derive(Clone, Default)]
    struct Recorder {
        events: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Handler for Recorder {
        fn on_connect(&mut self, session: &mut Session<'_>) {
            self.events.borrow_mut().push("connect");
            let _ = session.send_text("welcome");
        }

        fn on_message(&mut self, _session: &mut Session<'_>, _message: &Message) {
            self.events.borrow_mut().push("message");
        }

        fn on_close(&mut self, _conn_id: usize) {
            self.events.borrow_mut().push("close");
        }
    }

    fn client_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, true, opcode, payload, Some([1, 2, 3, 4]));
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_handshake_and_echo() {
        let stream = Builder::new()
            .read(REQUEST)
            .write(RESPONSE)
            .read(&client_frame(Opcode::Text, b"hello"))
            .write(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'])
            .build();

        let reason = handle_connection(stream, 0, Limits::default(), 1024, Echo)
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_failed_handshake_write_invokes_no_sink() {
        let stream = Builder::new()
            .read(REQUEST)
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
            .build();
        let handler = Recorder::default();
        let events = Rc::clone(&handler.events);

        let reason = handle_connection(stream, 4, Limits::default(), 1024, handler)
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::Transport(io::ErrorKind::BrokenPipe));
        assert!(events.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_connect_runs_after_response_is_written() {
        // A frame pipelined behind the request is held until the 101 is out.
        let mut first_read = REQUEST.to_vec();
        first_read.extend(client_frame(Opcode::Text, b"early"));

        let stream = Builder::new()
            .read(&first_read)
            .write(RESPONSE)
            .write(&[0x81, 0x07, b'w', b'e', b'l', b'c', b'o', b'm', b'e'])
            .build();
        let handler = Recorder::default();
        let events = Rc::clone(&handler.events);

        let reason = handle_connection(stream, 5, Limits::default(), 1024, handler)
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::PeerClosed);
        assert_eq!(*events.borrow(), vec!["connect", "message", "close"]);
    }

    #[tokio::test]
    async fn test_close_frame_is_echoed() {
        let stream = Builder::new()
            .read(REQUEST)
            .write(RESPONSE)
            .read(&client_frame(Opcode::Close, &[0x03, 0xE8]))
            .write(&[0x88, 0x02, 0x03, 0xE8])
            .build();

        let reason = handle_connection(stream, 1, Limits::default(), 1024, Echo)
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::CloseFrame);
    }

    #[tokio::test]
    async fn test_handshake_without_key_closes_silently() {
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .build();

        let reason = handle_connection(stream, 2, Limits::default(), 1024, Echo)
            .await
            .unwrap();
        assert!(matches!(reason, CloseReason::Handshake(_)));
    }

    #[tokio::test]
    async fn test_read_error_is_transport_close() {
        let stream = Builder::new()
            .read(REQUEST)
            .write(RESPONSE)
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let reason = handle_connection(stream, 3, Limits::default(), 1024, Echo)
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::Transport(io::ErrorKind::ConnectionReset));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            max_connections: 8,
            ..Config::default()
        };
        let server = Server::new(config, || Echo);
        assert_eq!(server.connection_limit.available_permits(), 8);
    }
}
