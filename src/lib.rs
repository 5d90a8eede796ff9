//! endpoint-io: pooled socket endpoints over completion and readiness I/O.
//!
//! The same connection/acceptor interface is implemented twice:
//! - on io_uring, where operations are posted and finish on worker threads
//! - on mio, where non-blocking calls are made when a socket is ready
//!
//! A generic `ConnectionPool` recycles connection objects across accepts,
//! and both engines ship an echo server built from these pieces.

pub mod config;
pub mod error;
pub mod runtime;

pub use error::{Error, Result};
