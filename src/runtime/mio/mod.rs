//! mio readiness engine.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS):
//! - `Reactor`: registers endpoints and routes events back to them
//! - `ReadinessAcceptor`: accepts into pooled connections, arming one when
//!   no peer is waiting
//! - `ReadinessConnection`: non-blocking reads and writes driven by an
//!   owner-supplied `DataExchange`
//! - `ReadinessEchoServer`: the echo service wired from the above

mod acceptor;
mod connection;
mod event_loop;
mod reactor;

pub use acceptor::{AcceptHandler, ReadinessAcceptor};
pub use connection::{DataExchange, ReadinessConnection};
pub use event_loop::{run, ReadinessEchoServer};
pub use reactor::{AsyncIo, ReadinessTarget, Reactor};
