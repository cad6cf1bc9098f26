//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Registrations are edge-triggered, so a readable event is drained until the
//! socket reports `WouldBlock`. Output the socket will not take immediately is
//! parked in the connection's `BufferedStream` and flushed on writability.

use crate::config::Config;
use crate::protocols::websocket::{Handler, Limits};
use crate::runtime::connection::{Connection, ConnectionRegistry, ProcessResult};
use crate::runtime::transport::BufferedStream;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Per-worker connection state for mio backend.
struct MioConnection {
    stream: BufferedStream<TcpStream>,
    conn: Connection,
    peer: SocketAddr,
    /// Currently registered for writability as well as readability.
    wants_write: bool,
}

/// Everything one worker thread owns.
struct Worker<H> {
    id: usize,
    poll: Poll,
    connections: ConnectionRegistry<MioConnection>,
    limits: Limits,
    max_write_backlog: usize,
    scratch: Vec<u8>,
    handler: H,
}

/// Run the mio-based server.
pub fn run<F, H>(config: Config, make_handler: F) -> io::Result<()>
where
    F: Fn() -> H + Send + Sync + 'static,
    H: Handler,
{
    let num_workers = config.worker_count();
    let addr = config.listen;

    info!(
        workers = num_workers,
        addr = %addr,
        "Starting mio runtime"
    );

    let make_handler = Arc::new(make_handler);
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let config = config.clone();
        let make_handler = Arc::clone(&make_handler);
        // Every listener is bound before any worker starts.
        let listener = create_listener_with_reuseport(addr)?;

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                let handler = make_handler();
                if let Err(e) = worker_loop(worker_id, listener, &config, handler) {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

fn worker_loop<H: Handler>(
    worker_id: usize,
    listener: std::net::TcpListener,
    config: &Config,
    handler: H,
) -> io::Result<()> {
    let poll = Poll::new()?;
    let mut events = Events::with_capacity(config.batch_size);

    listener.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut worker = Worker {
        id: worker_id,
        poll,
        connections: ConnectionRegistry::new(config.max_connections),
        limits: config.limits(),
        max_write_backlog: config.max_write_backlog,
        scratch: vec![0; config.read_buffer_size],
        handler,
    };

    info!(
        worker = worker_id,
        max_connections = config.max_connections,
        read_buffer_size = config.read_buffer_size,
        "Worker started"
    );

    loop {
        if let Err(e) = worker.poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => worker.accept_connections(&listener)?,
                Token(conn_id) => worker.handle_connection_event(conn_id, event),
            }
        }
    }
}

impl<H: Handler> Worker<H> {
    fn accept_connections(&mut self, listener: &TcpListener) -> io::Result<()> {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let limits = &self.limits;
                    let max_write_backlog = self.max_write_backlog;
                    let inserted = self.connections.insert_with(|id| MioConnection {
                        stream: BufferedStream::new(stream, max_write_backlog),
                        conn: Connection::new(id, limits),
                        peer,
                        wants_write: false,
                    });

                    let Some(conn_id) = inserted else {
                        warn!(worker = self.id, peer = %peer, "Connection limit reached");
                        continue;
                    };

                    let Some(entry) = self.connections.get_mut(conn_id) else {
                        continue;
                    };
                    if let Err(e) = self.poll.registry().register(
                        entry.stream.get_mut(),
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        warn!(worker = self.id, conn_id, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    debug!(worker = self.id, conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Accept error");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &mio::event::Event) {
        let Some(entry) = self.connections.get_mut(conn_id) else {
            return;
        };

        let mut result = ProcessResult::Continue;

        if event.is_writable() {
            result = flush(entry, &mut self.handler);
        }

        if result == ProcessResult::Continue && (event.is_readable() || event.is_read_closed()) {
            result = drain_readable(entry, &mut self.scratch, &mut self.handler);
        }

        if result == ProcessResult::Continue && event.is_error() {
            result = entry.conn.on_transport_error(
                io::ErrorKind::ConnectionReset,
                &mut entry.stream,
                &mut self.handler,
            );
        }

        match result {
            ProcessResult::Continue => self.update_interest(conn_id),
            ProcessResult::Closed(_) | ProcessResult::Stale => self.close_connection(conn_id),
        }
    }

    /// Ask for writability only while output is parked.
    fn update_interest(&mut self, conn_id: usize) {
        let Some(entry) = self.connections.get_mut(conn_id) else {
            return;
        };
        let wants_write = entry.stream.has_backlog();
        if wants_write == entry.wants_write {
            return;
        }
        let interest = if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self
            .poll
            .registry()
            .reregister(entry.stream.get_mut(), Token(conn_id), interest)
        {
            Ok(()) => entry.wants_write = wants_write,
            Err(e) => {
                debug!(conn_id, error = %e, "Reregister failed");
                entry.conn.on_transport_error(e.kind(), &mut entry.stream, &mut self.handler);
                self.close_connection(conn_id);
            }
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut entry) = self.connections.remove(conn_id) {
            // Already torn down if the core closed it; a no-op then.
            entry.conn.close(&mut entry.stream, &mut self.handler);
            // Best effort: a close frame may still be parked.
            let _ = entry.stream.flush_backlog();
            let _ = self.poll.registry().deregister(entry.stream.get_mut());

            debug!(worker = self.id, conn_id, peer = %entry.peer, "Connection closed");
        }
    }
}

/// Read until the socket would block, feeding every chunk to the core.
fn drain_readable<H: Handler>(
    entry: &mut MioConnection,
    scratch: &mut [u8],
    handler: &mut H,
) -> ProcessResult {
    loop {
        match entry.stream.get_mut().read(scratch) {
            Ok(0) => return entry.conn.on_eof(&mut entry.stream, handler),
            Ok(n) => {
                let result = entry.conn.on_data(&scratch[..n], &mut entry.stream, handler);
                if result != ProcessResult::Continue {
                    return result;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return ProcessResult::Continue;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return entry.conn.on_transport_error(e.kind(), &mut entry.stream, handler),
        }
    }
}

/// Write parked output. Once it is all out, a held-back upgrade completes.
fn flush<H: Handler>(entry: &mut MioConnection, handler: &mut H) -> ProcessResult {
    match entry.stream.flush_backlog() {
        Ok(true) => entry.conn.on_flushed(&mut entry.stream, handler),
        Ok(false) => ProcessResult::Continue,
        Err(e) => entry.conn.on_transport_error(e.kind(), &mut entry.stream, handler),
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::echo::EchoHandler;
    use crate::protocols::websocket::frame::CLOSE_FRAME;
    use std::io::Write;
    use std::time::Duration;

    const KEY: [u8; 4] = [0x0a, 0x1b, 0x2c, 0x3d];

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    const RESPONSE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

    fn client_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x80 | opcode];
        match payload.len() {
            n if n < 126 => frame.push(0x80 | n as u8),
            n if n <= u16::MAX as usize => {
                frame.push(0x80 | 126);
                frame.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                frame.push(0x80 | 127);
                frame.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }
        frame.extend_from_slice(&KEY);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ KEY[i % 4]));
        frame
    }

    fn spawn_worker(config: Config) -> SocketAddr {
        let listener = create_listener_with_reuseport("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || worker_loop(0, listener, &config, EchoHandler::new()));
        addr
    }

    fn connect(addr: SocketAddr) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    #[test]
    fn test_echo_over_loopback() {
        let addr = spawn_worker(Config::default());
        let mut client = connect(addr);

        client.write_all(REQUEST).unwrap();
        let mut response = vec![0; RESPONSE.len()];
        client.read_exact(&mut response).unwrap();
        assert_eq!(response, RESPONSE);

        client.write_all(&client_frame(0x1, b"hello")).unwrap();
        let mut echo = [0u8; 7];
        client.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"\x81\x05hello");

        // Larger than the socket buffers: the reply parks and drains on writability.
        let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        client.write_all(&client_frame(0x2, &payload)).unwrap();
        let mut header = [0u8; 10];
        client.read_exact(&mut header).unwrap();
        assert_eq!(&header[..2], &[0x82, 127]);
        assert_eq!(
            u64::from_be_bytes(header[2..].try_into().unwrap()),
            payload.len() as u64
        );
        let mut body = vec![0; payload.len()];
        client.read_exact(&mut body).unwrap();
        assert!(body == payload);

        client.write_all(&client_frame(0x8, &[0x03, 0xE8])).unwrap();
        let mut close = [0u8; 4];
        client.read_exact(&mut close).unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xE8]);
        let mut rest = [0u8; 1];
        assert_eq!(client.read(&mut rest).unwrap(), 0);
    }

    #[test]
    fn test_protocol_error_closes_socket() {
        let addr = spawn_worker(Config::default());
        let mut client = connect(addr);

        client.write_all(REQUEST).unwrap();
        let mut response = vec![0; RESPONSE.len()];
        client.read_exact(&mut response).unwrap();

        // Unmasked frame from a client.
        client.write_all(&[0x81, 0x02, b'h', b'i']).unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, CLOSE_FRAME);
    }

    #[test]
    fn test_connection_limit_refuses_extra_clients() {
        let config = Config {
            max_connections: 1,
            ..Config::default()
        };
        let addr = spawn_worker(config);

        let mut first = connect(addr);
        first.write_all(REQUEST).unwrap();
        let mut response = vec![0; RESPONSE.len()];
        first.read_exact(&mut response).unwrap();

        // Accepted by the kernel, then dropped without a response.
        let mut second = connect(addr);
        let _ = second.write_all(REQUEST);
        let mut buf = [0u8; 16];
        assert!(matches!(second.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_reuseport_listeners_share_address() {
        let first = create_listener_with_reuseport("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        let second = create_listener_with_reuseport(addr).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }
}
