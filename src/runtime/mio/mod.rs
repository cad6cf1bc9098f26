//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).

mod event_loop;

use crate::config::Config;
use crate::protocols::websocket::Handler;

/// Run the server using mio backend.
pub fn run<F, H>(config: Config, make_handler: F) -> std::io::Result<()>
where
    F: Fn() -> H + Send + Sync + 'static,
    H: Handler,
{
    event_loop::run(config, make_handler)
}
