//! Readiness-model connection.
//!
//! Reads and writes are non-blocking calls made when the socket is ready.
//! When a readiness event arrives the connection first flushes any write
//! left over from a previous event, then hands control to the owner's
//! `DataExchange` until it reports no more progress.

use super::reactor::{AsyncIo, ReadinessTarget, TokenSlot};
use crate::error::{Error, Result};
use crate::runtime::buffer::Buffer;
use crate::runtime::{ConnState, Connection, Endpoint, IoStatus, OpContext, OpKind};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Owner callback run on every readiness event.
pub trait DataExchange: Send + Sync {
    /// Move data between the peer and the owner.
    ///
    /// Returns the number of bytes processed. Zero means nothing more can
    /// be done until the next event.
    fn exchange(&self, connection: &Arc<ReadinessConnection>) -> Result<usize>;

    /// The exchange failed. The owner decides what happens to the peer.
    fn on_failure(&self, connection: &Arc<ReadinessConnection>, error: Error);
}

struct Inner {
    stream: Option<TcpStream>,
    state: ConnState,
    context: OpContext,
    read_buf: Buffer,
    write_buf: Buffer,
    received: usize,
    write_len: usize,
    written: usize,
}

impl Inner {
    /// Send what is left of the queued write.
    fn flush(&mut self) -> Result<IoStatus> {
        let Inner {
            stream,
            state,
            context,
            write_buf,
            write_len,
            written,
            ..
        } = self;
        let stream = stream.as_mut().ok_or(Error::NotBound)?;

        while *written < *write_len {
            match stream.write(&write_buf.as_slice()[*written..*write_len]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => *written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(sent = *written, total = *write_len, "Write deferred");
                    return Ok(IoStatus::Pending);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        *state = ConnState::ReadPending;
        context.record(OpKind::Write, *write_len);
        Ok(IoStatus::Transferred(*write_len))
    }
}

/// A connection driven by readiness events.
pub struct ReadinessConnection {
    token: TokenSlot,
    io: Arc<dyn AsyncIo>,
    handler: Arc<dyn DataExchange>,
    inner: Mutex<Inner>,
}

impl ReadinessConnection {
    /// Create an unbound connection with buffers of `buffer_size` bytes.
    pub fn new(
        io: Arc<dyn AsyncIo>,
        buffer_size: usize,
        handler: Arc<dyn DataExchange>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token: TokenSlot::new(),
            io,
            handler,
            inner: Mutex::new(Inner {
                stream: None,
                state: ConnState::Initial,
                context: OpContext::default(),
                read_buf: Buffer::new(buffer_size),
                write_buf: Buffer::new(buffer_size),
                received: 0,
                write_len: 0,
                written: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a freshly accepted, non-blocking stream.
    pub(crate) fn bind_stream(&self, stream: TcpStream) {
        let mut inner = self.lock();
        debug_assert!(inner.state.is_initial(), "bind on a connection in use");
        inner.stream = Some(stream);
        inner.state = ConnState::ReadPending;
        inner.received = 0;
        inner.write_len = 0;
        inner.written = 0;
    }

    /// Close the socket and return to `Initial`. No-op if already there.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state.is_initial() {
            return;
        }
        inner.stream = None;
        inner.state = ConnState::Initial;
        inner.context.reset();
        inner.read_buf.clear();
        inner.write_buf.clear();
        inner.received = 0;
        inner.write_len = 0;
        inner.written = 0;
    }

    /// Flush leftovers, then run the exchange until it stalls.
    fn drive(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                ConnState::Initial | ConnState::DisconnectPending => return Ok(()),
                ConnState::WritePending => {
                    if inner.flush()? == IoStatus::Pending {
                        return Ok(());
                    }
                }
                ConnState::ReadPending => {}
            }
        }

        loop {
            let processed = self.handler.exchange(self)?;
            if processed == 0 {
                return Ok(());
            }

            let mut inner = self.lock();
            if inner.state.is_initial() {
                return Ok(());
            }
            inner.read_buf.clear_prefix(processed);
            if inner.state != ConnState::WritePending {
                inner.write_buf.clear_prefix(processed);
            }
        }
    }
}

impl Endpoint for ReadinessConnection {
    fn handle(&self) -> Option<RawFd> {
        self.lock().stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn token(&self) -> Option<usize> {
        self.token.get()
    }

    fn context(&self) -> OpContext {
        self.lock().context
    }

    fn reset_context(&self) {
        self.lock().context.reset();
    }
}

impl Connection for ReadinessConnection {
    /// Read whatever is available now.
    ///
    /// Returns `WouldBlock` if nothing is available or a write is still
    /// being flushed.
    fn read_async(&self) -> Result<IoStatus> {
        let mut inner = self.lock();
        if inner.state == ConnState::WritePending {
            return Ok(IoStatus::WouldBlock);
        }

        let Inner {
            stream,
            context,
            read_buf,
            received,
            ..
        } = &mut *inner;
        let stream = stream.as_mut().ok_or(Error::NotBound)?;

        loop {
            match stream.read(read_buf.as_mut_slice()) {
                Ok(n) => {
                    *received = n;
                    context.record(OpKind::Read, n);
                    return Ok(IoStatus::Transferred(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoStatus::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Queue `data` and send as much as the socket takes now.
    ///
    /// Returns `Transferred` once every byte is sent, or `Pending` if the
    /// rest goes out on a later writable event.
    fn write_async(&self, data: &[u8]) -> Result<IoStatus> {
        let mut inner = self.lock();
        if inner.stream.is_none() {
            return Err(Error::NotBound);
        }

        let len = inner.write_buf.fill(data)?;
        inner.write_len = len;
        inner.written = 0;
        inner.state = ConnState::WritePending;
        inner.flush()
    }

    fn input_data(&self) -> Vec<u8> {
        let inner = self.lock();
        debug_assert_eq!(
            inner.state,
            ConnState::ReadPending,
            "input extracted outside a completed read"
        );
        inner.read_buf.prefix(inner.received).to_vec()
    }

    /// Stop monitoring and close the socket.
    fn disconnect(&self) -> Result<()> {
        if self.state().is_initial() {
            return Ok(());
        }
        let stopped = self.io.stop(self);
        self.reset();
        stopped
    }

    fn state(&self) -> ConnState {
        self.lock().state
    }
}

impl ReadinessTarget for ReadinessConnection {
    fn complete(self: Arc<Self>) -> Result<()> {
        if let Err(e) = self.drive() {
            self.handler.on_failure(&self, e);
        }
        Ok(())
    }

    fn attach(&self, token: usize) {
        self.token.set(token);
    }

    fn detach(&self) -> Option<usize> {
        self.token.take()
    }
}

impl Drop for ReadinessConnection {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
