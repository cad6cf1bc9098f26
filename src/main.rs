//! grow-a-websocket: a WebSocket echo server
//!
//! Features:
//! - RFC 6455 opening handshake and framing
//! - Incremental frame parsing over arbitrary read boundaries
//! - Fragmented message reassembly with bounded memory
//! - mio (epoll/kqueue) or tokio runtime
//! - Configuration via CLI arguments or TOML file

use grow_a_websocket::config::{Config, RuntimeType};
use grow_a_websocket::protocols::echo::EchoHandler;
use grow_a_websocket::runtime;
use grow_a_websocket::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        runtime = ?config.runtime,
        max_connections = config.max_connections,
        max_frame_size = config.max_frame_size,
        max_message_size = config.max_message_size,
        "Starting grow-a-websocket server"
    );

    match config.runtime {
        RuntimeType::Mio => run_mio(config),
        RuntimeType::Tokio => run_tokio(config),
    }
}

/// Run with mio runtime (epoll on Linux, kqueue on macOS)
fn run_mio(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using mio runtime (epoll/kqueue)");
    runtime::run(config, EchoHandler::new)?;
    Ok(())
}

/// Run with tokio runtime, one task per connection
fn run_tokio(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using tokio runtime");
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_count())
        .enable_all()
        .build()?;
    let server = Server::new(config, EchoHandler::new);
    rt.block_on(server.run())
}
