//! Completion-model connection.
//!
//! Reads, writes and disconnects are posted to the completion port and
//! finish on a worker thread, which routes the result through the state
//! machine and then into the owner's `ConnectionHandler`. The socket is
//! closed asynchronously on disconnect, and the connection object returns
//! to `Initial` so a later accept can reuse it.

use super::port::{CompletionPort, CompletionTarget};
use crate::error::{Error, Result};
use crate::runtime::buffer::Buffer;
use crate::runtime::{ConnState, Connection, Endpoint, IoStatus, OpContext, OpKind, Step};
use io_uring::{opcode, squeue, types};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace, warn};

/// Owner callbacks, one per kind of completion.
///
/// Called on a worker thread with no connection lock held.
pub trait ConnectionHandler: Send + Sync {
    /// A read delivered data. `input_data` returns it.
    fn on_read(&self, connection: &Arc<CompletionConnection>);

    /// A write finished sending every byte.
    fn on_write(&self, connection: &Arc<CompletionConnection>);

    /// The socket is closed and the connection is back in `Initial`.
    fn on_disconnect(&self, connection: &Arc<CompletionConnection>);
}

struct Inner {
    socket: Option<OwnedFd>,
    state: ConnState,
    context: OpContext,
    read_buf: Buffer,
    write_buf: Buffer,
    /// Bytes delivered by the last read.
    received: usize,
    /// Bytes queued by the last write.
    write_len: usize,
    /// Bytes of the last write already sent.
    written: usize,
    /// Completions handled so far.
    completions: u64,
}

impl Inner {
    fn fd(&self) -> Result<RawFd> {
        self.socket
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(Error::NotBound)
    }
}

/// A connection driven by the completion port.
pub struct CompletionConnection {
    port: Arc<CompletionPort>,
    token: usize,
    handler: Arc<dyn ConnectionHandler>,
    inner: Mutex<Inner>,
}

impl CompletionConnection {
    /// Create an unbound connection with buffers of `buffer_size` bytes.
    pub fn new(
        port: &Arc<CompletionPort>,
        buffer_size: usize,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let target: Weak<dyn CompletionTarget> = me.clone();
            Self {
                port: Arc::clone(port),
                token: port.bind(target),
                handler,
                inner: Mutex::new(Inner {
                    socket: None,
                    state: ConnState::Initial,
                    context: OpContext::default(),
                    read_buf: Buffer::new(buffer_size),
                    write_buf: Buffer::new(buffer_size),
                    received: 0,
                    write_len: 0,
                    written: 0,
                    completions: 0,
                }),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a freshly accepted socket.
    pub(crate) fn bind_socket(&self, socket: OwnedFd) {
        let mut inner = self.lock();
        debug_assert!(inner.state.is_initial(), "bind on a connection in use");
        inner.socket = Some(socket);
        inner.received = 0;
        inner.write_len = 0;
        inner.written = 0;
    }

    /// Return to `Initial`: socket dropped, context cleared, buffers zeroed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.socket = None;
        inner.state = ConnState::Initial;
        inner.context.reset();
        inner.read_buf.clear();
        inner.write_buf.clear();
        inner.received = 0;
        inner.write_len = 0;
        inner.written = 0;
    }

    /// Capacity of each transfer buffer.
    pub fn buffer_size(&self) -> usize {
        self.lock().read_buf.capacity()
    }

    fn post(&self, inner: &mut Inner, op: OpKind, entry: squeue::Entry) -> Result<()> {
        let entry = entry.user_data(self.token as u64);
        inner.context.begin(op);
        // SAFETY: entries only point into `read_buf`, `write_buf` or nothing.
        // The buffers are never reallocated, and `Drop` leaks them rather
        // than freeing them while an operation is in flight.
        let submitted = unsafe { self.port.submit(&entry) };
        if submitted.is_err() {
            inner.context.reset();
        }
        submitted
    }

    fn post_send(&self, inner: &mut Inner) -> Result<()> {
        let fd = inner.fd()?;
        let remaining = &inner.write_buf.as_slice()[inner.written..inner.write_len];
        let entry = opcode::Send::new(types::Fd(fd), remaining.as_ptr(), remaining.len() as u32)
            .build();
        self.post(inner, OpKind::Write, entry)
    }

    fn begin_disconnect(&self, inner: &mut Inner) -> Result<()> {
        let fd = inner.socket.take().map(IntoRawFd::into_raw_fd);
        let entry = match fd {
            Some(fd) => opcode::Close::new(types::Fd(fd)).build(),
            // Nothing to close; still complete through the port so the
            // owner sees the same callback sequence.
            None => opcode::Nop::new().build(),
        };

        inner.state = ConnState::DisconnectPending;
        if let Err(e) = self.post(inner, OpKind::Disconnect, entry) {
            if let Some(fd) = fd {
                // SAFETY: never queued, so the descriptor released by
                // `into_raw_fd` above is still ours.
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
            }
            inner.state = ConnState::Initial;
            return Err(e);
        }
        Ok(())
    }

    fn finish_disconnect(self: &Arc<Self>) {
        self.reset();
        self.handler.on_disconnect(self);
    }
}

impl Endpoint for CompletionConnection {
    fn handle(&self) -> Option<RawFd> {
        self.lock().fd().ok()
    }

    fn token(&self) -> Option<usize> {
        Some(self.token)
    }

    fn context(&self) -> OpContext {
        self.lock().context
    }

    fn reset_context(&self) {
        self.lock().context.reset();
    }
}

impl Connection for CompletionConnection {
    fn read_async(&self) -> Result<IoStatus> {
        let mut inner = self.lock();
        let fd = inner.fd()?;

        let prior = inner.state;
        inner.received = 0;
        inner.state = ConnState::ReadPending;

        let len = inner.read_buf.capacity() as u32;
        let entry = opcode::Recv::new(types::Fd(fd), inner.read_buf.as_mut_ptr(), len).build();
        if let Err(e) = self.post(&mut inner, OpKind::Read, entry) {
            inner.state = prior;
            return Err(e);
        }
        Ok(IoStatus::Pending)
    }

    fn write_async(&self, data: &[u8]) -> Result<IoStatus> {
        if data.is_empty() {
            return Ok(IoStatus::Transferred(0));
        }

        let mut inner = self.lock();
        inner.fd()?;

        let len = inner.write_buf.fill(data)?;
        let prior = inner.state;
        inner.write_len = len;
        inner.written = 0;
        inner.state = ConnState::WritePending;

        if let Err(e) = self.post_send(&mut inner) {
            inner.state = prior;
            return Err(e);
        }
        Ok(IoStatus::Pending)
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

    /// Post an asynchronous close. `on_disconnect` fires once it finishes.
    fn disconnect(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == ConnState::DisconnectPending {
            return Ok(());
        }
        self.begin_disconnect(&mut inner)
    }

    fn state(&self) -> ConnState {
        self.lock().state
    }
}

impl CompletionTarget for CompletionConnection {
    fn complete(self: Arc<Self>, result: i32) {
        let transferred = if result < 0 {
            debug!(conn = self.token, error = %Error::from_code(-result), "Operation failed");
            0
        } else {
            result as usize
        };

        // Decide under the lock, act without it.
        let (step, clear_len, seen) = {
            let mut inner = self.lock();
            inner.completions += 1;
            inner.context.finish(transferred);
            let step = inner.state.on_completion(transferred);

            let clear_len = match step {
                Step::Dispatch(ConnState::ReadPending) => {
                    inner.received = transferred;
                    transferred
                }
                Step::Dispatch(ConnState::WritePending) => {
                    inner.written += transferred;
                    if inner.written < inner.write_len {
                        trace!(
                            conn = self.token,
                            sent = inner.written,
                            total = inner.write_len,
                            "Partial send"
                        );
                        self.resume_send(inner);
                        return;
                    }
                    inner.write_len
                }
                _ => 0,
            };
            (step, clear_len, inner.completions)
        };

        debug_assert_ne!(step, Step::Stray, "completion for idle connection {}", self.token);

        match step {
            Step::Dispatch(state) => {
                match state {
                    ConnState::ReadPending => self.handler.on_read(&self),
                    _ => self.handler.on_write(&self),
                }

                // Zero what was transferred, unless the buffer is already
                // carrying the next operation.
                let mut inner = self.lock();
                if inner.state != state && inner.completions == seen {
                    match state {
                        ConnState::ReadPending => inner.read_buf.clear_prefix(clear_len),
                        _ => inner.write_buf.clear_prefix(clear_len),
                    }
                }
            }
            Step::BeginDisconnect => {
                debug!(conn = self.token, "Peer closed connection");
                let started = {
                    let mut inner = self.lock();
                    self.begin_disconnect(&mut inner)
                };
                if let Err(e) = started {
                    warn!(conn = self.token, error = %e, "Failed to post disconnect");
                    self.finish_disconnect();
                }
            }
            Step::Recycle => {
                if result < 0 {
                    warn!(conn = self.token, error = %Error::from_code(-result), "Close failed");
                }
                self.finish_disconnect();
            }
            Step::Stray => {
                warn!(conn = self.token, result, "Completion for idle connection");
            }
        }
    }
}

impl CompletionConnection {
    /// Post the unsent tail of a partial write, or give up on the peer.
    fn resume_send(self: &Arc<Self>, mut inner: MutexGuard<'_, Inner>) {
        let Err(e) = self.post_send(&mut inner) else {
            return;
        };
        warn!(conn = self.token, error = %e, "Failed to resume send");

        if self.begin_disconnect(&mut inner).is_err() {
            drop(inner);
            self.finish_disconnect();
        }
    }
}

impl Drop for CompletionConnection {
    fn drop(&mut self) {
        self.port.unbind(self.token);

        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(op) = inner.context.in_flight {
            // The kernel may still read or write these.
            warn!(conn = self.token, op = ?op, "Dropping connection with operation in flight");
            inner.read_buf.leak();
            inner.write_buf.leak();
        }
    }
}
