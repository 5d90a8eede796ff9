//! endpoint-io: TCP echo server over pooled socket endpoints.
//!
//! Features:
//! - io_uring completion backend (Linux)
//! - mio readiness backend (epoll on Linux, kqueue on macOS)
//! - Connection objects recycled through a pool
//! - Configuration via CLI arguments or TOML file

use endpoint_io::config::Config;
use endpoint_io::runtime;
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
        host = %config.host,
        port = config.port,
        backend = ?config.backend,
        workers = config.worker_count(),
        pool_size = config.pool_size,
        buffer_size = config.buffer_size,
        "Starting endpoint-io echo server"
    );

    runtime::run(config)?;
    Ok(())
}
