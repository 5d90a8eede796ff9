//! The endpoint interface shared by both I/O engines.
//!
//! An endpoint is either an acceptor (a listening socket that produces
//! connections) or a connection (a socket exchanging data with one peer).
//! The traits here describe what an owner can ask of either kind without
//! knowing which engine drives it:
//!
//! - `Endpoint`: handle, token and pending-operation context
//! - `Connection`: read, write, input extraction, disconnect
//! - `Acceptor`: accept into a pooled connection, peer and local address
//!
//! Every method takes `&self`. Endpoints keep their mutable state behind an
//! internal lock that is released before any owner callback runs, so
//! callbacks may call straight back into the endpoint.

use crate::error::Result;
use crate::runtime::ConnState;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Outcome of starting a read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The operation was posted and will complete later.
    Pending,
    /// The operation finished immediately, moving this many bytes.
    /// Zero on a read means the peer closed its side.
    Transferred(usize),
    /// Nothing could be done now. Try again on the next readiness event.
    WouldBlock,
}

/// Kind of operation an endpoint has outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Accept,
    Read,
    Write,
    Disconnect,
}

/// Per-endpoint record of the outstanding operation.
///
/// At most one operation is outstanding per endpoint at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpContext {
    /// Operation currently in flight, if any.
    pub in_flight: Option<OpKind>,
    /// Last operation that finished.
    pub last: Option<OpKind>,
    /// Bytes moved by the last finished operation.
    pub transferred: usize,
}

impl OpContext {
    /// Record that `op` has been posted.
    pub fn begin(&mut self, op: OpKind) {
        debug_assert!(
            self.in_flight.is_none(),
            "{op:?} posted while {:?} is outstanding",
            self.in_flight
        );
        self.in_flight = Some(op);
    }

    /// Record that the outstanding operation finished.
    pub fn finish(&mut self, transferred: usize) -> Option<OpKind> {
        let op = self.in_flight.take();
        self.last = op;
        self.transferred = transferred;
        op
    }

    /// Record an operation that finished without being posted.
    pub fn record(&mut self, op: OpKind, transferred: usize) {
        self.last = Some(op);
        self.transferred = transferred;
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub fn reset(&mut self) {
        *self = OpContext::default();
    }
}

/// Behavior common to every endpoint.
pub trait Endpoint: Send + Sync {
    /// The underlying socket handle, if one is bound.
    fn handle(&self) -> Option<RawFd>;

    /// Token the engine routes events with, if registered.
    fn token(&self) -> Option<usize>;

    /// Snapshot of the pending-operation context.
    fn context(&self) -> OpContext;

    /// Clear the pending-operation context.
    fn reset_context(&self);
}

/// A socket exchanging data with one peer.
pub trait Connection: Endpoint {
    /// Start a read into the connection's read buffer.
    fn read_async(&self) -> Result<IoStatus>;

    /// Copy `data` into the write buffer and start sending it.
    ///
    /// Fails with `Error::PayloadTooLarge` if `data` does not fit.
    fn write_async(&self, data: &[u8]) -> Result<IoStatus>;

    /// Bytes delivered by the most recent read.
    fn input_data(&self) -> Vec<u8>;

    /// `input_data` decoded as UTF-8, with invalid sequences replaced.
    fn input_text(&self) -> String {
        String::from_utf8_lossy(&self.input_data()).into_owned()
    }

    /// Detach from the peer.
    fn disconnect(&self) -> Result<()>;

    fn state(&self) -> ConnState;
}

/// A listening socket that accepts peers into pooled connections.
pub trait Acceptor: Endpoint {
    type Connection: Connection;

    /// Accept the next peer into `connection`.
    ///
    /// Returns `Ok(true)` when the accept was started or finished, and
    /// `Ok(false)` when no peer was waiting; the connection then stays armed
    /// and is filled on the next readiness event.
    fn accept_async(&self, connection: Arc<Self::Connection>) -> Result<bool>;

    /// Describe the most recently accepted peer.
    fn peer_info(&self) -> Result<String>;

    /// Address the acceptor is listening on.
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Format the peer line logged on every accept.
pub(crate) fn describe_peer(addr: &SocketAddr) -> String {
    format!("Peer {}:{} connected.", addr.ip(), addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_peer() {
        let v6: SocketAddr = "[::1]:50123".parse().unwrap();
        assert_eq!(describe_peer(&v6), "Peer ::1:50123 connected.");

        let v4: SocketAddr = "127.0.0.1:7777".parse().unwrap();
        assert_eq!(describe_peer(&v4), "Peer 127.0.0.1:7777 connected.");
    }

    #[test]
    fn test_op_context_lifecycle() {
        let mut ctx = OpContext::default();
        assert!(ctx.is_idle());

        ctx.begin(OpKind::Read);
        assert!(!ctx.is_idle());
        assert_eq!(ctx.in_flight, Some(OpKind::Read));

        assert_eq!(ctx.finish(12), Some(OpKind::Read));
        assert!(ctx.is_idle());
        assert_eq!(ctx.last, Some(OpKind::Read));
        assert_eq!(ctx.transferred, 12);

        ctx.reset();
        assert_eq!(ctx, OpContext::default());
    }

    #[test]
    fn test_op_context_record() {
        let mut ctx = OpContext::default();
        ctx.record(OpKind::Write, 4);
        assert!(ctx.is_idle());
        assert_eq!(ctx.last, Some(OpKind::Write));
        assert_eq!(ctx.transferred, 4);
    }
}
