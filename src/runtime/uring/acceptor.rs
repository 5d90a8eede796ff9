//! Completion-model acceptor.
//!
//! One accept is outstanding at a time. The pooled connection it will fill
//! is parked in the acceptor until the completion arrives; the kernel
//! writes the peer address into storage owned by the acceptor.

use super::connection::CompletionConnection;
use super::port::{CompletionPort, CompletionTarget};
use crate::error::{Error, Result};
use crate::runtime::endpoint::describe_peer;
use crate::runtime::listener::{create_listener, to_socket_addr};
use crate::runtime::{Acceptor, Endpoint, OpContext, OpKind};
use io_uring::{opcode, types};
use socket2::{SockAddr, Socket};
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

/// Owner callbacks for accept completions.
pub trait AcceptHandler: Send + Sync {
    /// A peer was accepted into `connection`, which is ready to read.
    fn on_accept(&self, acceptor: &Arc<CompletionAcceptor>, connection: Arc<CompletionConnection>);

    /// The accept failed. `connection` was never bound to a peer.
    fn on_accept_failed(
        &self,
        acceptor: &Arc<CompletionAcceptor>,
        connection: Arc<CompletionConnection>,
        error: Error,
    );
}

/// Peer address filled in by the kernel.
struct PeerSlot {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl PeerSlot {
    fn new() -> Self {
        Self {
            // SAFETY: all-zero is a valid `sockaddr_storage`.
            storage: unsafe { mem::zeroed() },
            len: 0,
        }
    }

    fn arm(&mut self) {
        *self = PeerSlot::new();
        self.len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    }
}

struct AcceptState {
    context: OpContext,
    /// Boxed so its address is stable and can be leaked on drop.
    peer: Box<PeerSlot>,
    /// Set once an accept has completed successfully.
    has_peer: bool,
    pending: Option<Arc<CompletionConnection>>,
}

/// A listening socket whose accepts complete on the port.
pub struct CompletionAcceptor {
    port: Arc<CompletionPort>,
    token: usize,
    listener: Socket,
    handler: Arc<dyn AcceptHandler>,
    state: Mutex<AcceptState>,
}

impl CompletionAcceptor {
    /// Bind a listener to `addr` and associate it with the port.
    pub fn new(
        port: &Arc<CompletionPort>,
        addr: SocketAddr,
        handler: Arc<dyn AcceptHandler>,
    ) -> Result<Arc<Self>> {
        let listener = create_listener(addr, false)?;

        Ok(Arc::new_cyclic(|me: &Weak<Self>| {
            let target: Weak<dyn CompletionTarget> = me.clone();
            Self {
                port: Arc::clone(port),
                token: port.bind(target),
                listener,
                handler,
                state: Mutex::new(AcceptState {
                    context: OpContext::default(),
                    peer: Box::new(PeerSlot::new()),
                    has_peer: false,
                    pending: None,
                }),
            }
        }))
    }

    fn lock(&self) -> MutexGuard<'_, AcceptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop listening. An outstanding accept completes with an error.
    pub fn close(&self) {
        if let Err(e) = self.listener.shutdown(Shutdown::Both) {
            debug!(error = %e, "Listener shutdown");
        }
    }
}

impl Endpoint for CompletionAcceptor {
    fn handle(&self) -> Option<RawFd> {
        Some(self.listener.as_raw_fd())
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

impl Acceptor for CompletionAcceptor {
    type Connection = CompletionConnection;

    fn accept_async(&self, connection: Arc<CompletionConnection>) -> Result<bool> {
        let mut state = self.lock();
        let AcceptState { context, peer, pending, .. } = &mut *state;

        peer.arm();
        let entry = opcode::Accept::new(
            types::Fd(self.listener.as_raw_fd()),
            &mut peer.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut peer.len,
        )
        .flags(libc::SOCK_CLOEXEC)
        .build()
        .user_data(self.token as u64);

        context.begin(OpKind::Accept);
        *pending = Some(connection);

        // SAFETY: the peer slot is boxed, only re-armed by the next accept,
        // and leaked by `Drop` if this one is still in flight.
        if let Err(e) = unsafe { self.port.submit(&entry) } {
            context.reset();
            *pending = None;
            return Err(e);
        }
        Ok(true)
    }

    fn peer_info(&self) -> Result<String> {
        let state = self.lock();
        if !state.has_peer {
            return Err(Error::from_code(libc::ENOTCONN));
        }

        // SAFETY: the kernel wrote a valid address of `len` bytes.
        let addr = unsafe { SockAddr::new(state.peer.storage, state.peer.len) };
        Ok(describe_peer(&to_socket_addr(&addr)?))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        to_socket_addr(&self.listener.local_addr()?)
    }
}

impl CompletionTarget for CompletionAcceptor {
    fn complete(self: Arc<Self>, result: i32) {
        let connection = {
            let mut state = self.lock();
            state.context.finish(result.max(0) as usize);
            state.has_peer = result >= 0;
            state.pending.take()
        };

        let Some(connection) = connection else {
            warn!(result, "Accept completed with no connection armed");
            if result >= 0 {
                // SAFETY: the kernel handed us this descriptor.
                drop(unsafe { OwnedFd::from_raw_fd(result) });
            }
            return;
        };

        if result < 0 {
            self.handler
                .on_accept_failed(&self, connection, Error::from_code(-result));
            return;
        }

        // SAFETY: a non-negative accept result is a new descriptor we own.
        connection.bind_socket(unsafe { OwnedFd::from_raw_fd(result) });
        self.handler.on_accept(&self, connection);
    }
}

impl Drop for CompletionAcceptor {
    fn drop(&mut self) {
        self.port.unbind(self.token);

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.context.is_idle() {
            // The kernel may still write the peer address.
            mem::forget(mem::replace(&mut state.peer, Box::new(PeerSlot::new())));
        }
    }
}
