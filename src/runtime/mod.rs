//! Socket endpoints for two I/O models behind one interface.
//!
//! Platform-specific engines:
//! - Linux: io_uring for completion-based I/O (`uring`)
//! - Linux and macOS: mio (epoll/kqueue) for readiness-based I/O (`mio`)
//!
//! Both share common abstractions:
//! - `Endpoint`, `Connection`, `Acceptor`: what an owner can ask of a socket
//! - `ConnState`: the connection state machine
//! - `ConnectionPool`: reusable connection objects
//! - `Buffer`: fixed per-connection transfer buffers

mod buffer;
mod connection;
mod endpoint;
pub mod listener;
pub mod pool;
mod token;

pub use buffer::{Buffer, DEFAULT_BUFFER_SIZE};
pub use connection::{ConnState, Step};
pub use endpoint::{Acceptor, Connection, Endpoint, IoStatus, OpContext, OpKind};
pub use pool::{ConnectionPool, HashContainer, ListContainer};
pub use token::TokenRegistry;

#[cfg(target_os = "linux")]
pub mod uring;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod mio;

use crate::config::{Backend, Config};
use crate::error::Result;

/// Run the echo server on the configured backend until the process exits.
pub fn run(config: Config) -> Result<()> {
    match config.backend {
        Backend::Completion => run_completion(config),
        Backend::Readiness => run_readiness(config),
    }
}

#[cfg(target_os = "linux")]
fn run_completion(config: Config) -> Result<()> {
    uring::run(config)
}

#[cfg(not(target_os = "linux"))]
fn run_completion(_config: Config) -> Result<()> {
    Err(crate::Error::Config(
        "completion backend requires io_uring (Linux only)".to_string(),
    ))
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_readiness(config: Config) -> Result<()> {
    mio::run(config)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn run_readiness(_config: Config) -> Result<()> {
    Err(crate::Error::Config(
        "Unsupported platform: only Linux and macOS are supported".to_string(),
    ))
}
