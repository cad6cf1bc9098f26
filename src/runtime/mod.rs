//! Runtime plumbing shared by the I/O drivers.
//!
//! - `ByteBuffer`: bounded, chunk-grown byte accumulator
//! - `Transport`: byte sink the protocol core writes through
//! - `Connection`: per-connection lifecycle state machine
//! - `mio`: readiness event loop, one poller per worker thread

pub mod buffer;
pub mod connection;
pub mod transport;

mod mio;

pub use connection::{CloseReason, Connection, ConnectionRegistry, Phase, ProcessResult};
pub use transport::{BufferedStream, Transport};

use crate::config::Config;
use crate::protocols::websocket::Handler;

/// Run the server on the mio backend.
///
/// Each worker thread calls `make_handler` once and serves all of its
/// connections with the resulting handler.
pub fn run<F, H>(config: Config, make_handler: F) -> std::io::Result<()>
where
    F: Fn() -> H + Send + Sync + 'static,
    H: Handler,
{
    self::mio::run(config, make_handler)
}
