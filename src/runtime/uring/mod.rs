//! Linux io_uring completion engine.
//!
//! Operations are posted to a shared ring and finish on worker threads:
//! - `CompletionPort`: the ring, its workers and the token registry
//! - `CompletionAcceptor`: posts accepts into pooled connections
//! - `CompletionConnection`: posts reads, writes and closes
//! - `CompletionEchoServer`: the echo service wired from the above

mod acceptor;
mod connection;
mod event_loop;
mod port;

pub use acceptor::{AcceptHandler, CompletionAcceptor};
pub use connection::{CompletionConnection, ConnectionHandler};
pub use event_loop::{run, CompletionEchoServer};
pub use port::{is_supported, CompletionPort, CompletionTarget};
