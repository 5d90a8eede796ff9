//! Readiness-model acceptor.
//!
//! Accepts are attempted immediately. When no peer is waiting, the pooled
//! connection stays armed in the acceptor and the next readable event on
//! the listener fills it and reports it through `AcceptHandler`.

use super::connection::ReadinessConnection;
use super::reactor::{AsyncIo, ReadinessTarget, TokenSlot};
use crate::error::{Error, Result};
use crate::runtime::endpoint::describe_peer;
use crate::runtime::listener::create_listener;
use crate::runtime::{Acceptor, Endpoint, OpContext, OpKind};
use mio::net::TcpListener;
use mio::Interest;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Owner callbacks for accepts that finish on a readiness event.
pub trait AcceptHandler: Send + Sync {
    /// A peer was accepted into `connection`, which is now monitored.
    fn on_accept(&self, acceptor: &Arc<ReadinessAcceptor>, connection: Arc<ReadinessConnection>);

    /// Accepting into the armed `connection` failed.
    fn on_accept_failed(
        &self,
        acceptor: &Arc<ReadinessAcceptor>,
        connection: Arc<ReadinessConnection>,
        error: Error,
    );
}

struct AcceptState {
    context: OpContext,
    peer: Option<SocketAddr>,
    armed: Option<Arc<ReadinessConnection>>,
}

/// A non-blocking listening socket monitored for readiness.
pub struct ReadinessAcceptor {
    listener: TcpListener,
    token: TokenSlot,
    io: Arc<dyn AsyncIo>,
    handler: Arc<dyn AcceptHandler>,
    state: Mutex<AcceptState>,
}

impl ReadinessAcceptor {
    /// Bind a listener to `addr` and start monitoring it.
    pub fn new(
        io: Arc<dyn AsyncIo>,
        addr: SocketAddr,
        handler: Arc<dyn AcceptHandler>,
    ) -> Result<Arc<Self>> {
        let socket = create_listener(addr, true)?;
        let listener = TcpListener::from_std(socket.into());

        let acceptor = Arc::new(Self {
            listener,
            token: TokenSlot::new(),
            io: Arc::clone(&io),
            handler,
            state: Mutex::new(AcceptState {
                context: OpContext::default(),
                peer: None,
                armed: None,
            }),
        });

        let target: Arc<dyn ReadinessTarget> = acceptor.clone();
        io.start(target)?;
        Ok(acceptor)
    }

    fn lock(&self) -> MutexGuard<'_, AcceptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while a connection is waiting for the next peer.
    pub fn is_armed(&self) -> bool {
        self.lock().armed.is_some()
    }
}

impl Endpoint for ReadinessAcceptor {
    fn handle(&self) -> Option<RawFd> {
        Some(self.listener.as_raw_fd())
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

impl Acceptor for ReadinessAcceptor {
    type Connection = ReadinessConnection;

    fn accept_async(&self, connection: Arc<ReadinessConnection>) -> Result<bool> {
        let (stream, peer) = loop {
            match self.listener.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let mut state = self.lock();
                    state.context.begin(OpKind::Accept);
                    state.armed = Some(connection);
                    return Ok(false);
                }
                // The peer gave up before we got to it; try the next one.
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!("Peer aborted before accept");
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        };

        connection.bind_stream(stream);
        {
            let mut state = self.lock();
            state.peer = Some(peer);
            state.context.record(OpKind::Accept, 0);
        }

        let target: Arc<dyn ReadinessTarget> = connection.clone();
        if let Err(e) = self.io.start(target) {
            connection.reset();
            return Err(e);
        }
        Ok(true)
    }

    fn peer_info(&self) -> Result<String> {
        self.lock()
            .peer
            .as_ref()
            .map(describe_peer)
            .ok_or_else(|| Error::from_code(libc::ENOTCONN))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

impl ReadinessTarget for ReadinessAcceptor {
    fn complete(self: Arc<Self>) -> Result<()> {
        let armed = {
            let mut state = self.lock();
            let armed = state.armed.take();
            if armed.is_some() {
                state.context.finish(0);
            }
            armed
        };

        // Nobody waiting: leave the peer in the backlog for the next arm.
        let Some(connection) = armed else {
            return Ok(());
        };

        match self.accept_async(Arc::clone(&connection)) {
            Ok(true) => self.handler.on_accept(&self, connection),
            Ok(false) => {}
            Err(e) => self.handler.on_accept_failed(&self, connection, e),
        }
        Ok(())
    }

    fn attach(&self, token: usize) {
        self.token.set(token);
    }

    fn detach(&self) -> Option<usize> {
        self.token.take()
    }

    /// A listener only ever becomes readable.
    fn interest(&self) -> Interest {
        Interest::READABLE
    }
}

impl Drop for ReadinessAcceptor {
    fn drop(&mut self) {
        let _ = self.io.stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::listener::loopback;
    use crate::runtime::mio::connection::DataExchange;
    use crate::runtime::mio::reactor::Reactor;
    use crate::runtime::Connection;
    use mio::{Events, Poll, Token};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        accepted: AtomicUsize,
    }

    impl AcceptHandler for Counter {
        fn on_accept(&self, _: &Arc<ReadinessAcceptor>, _: Arc<ReadinessConnection>) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }

        fn on_accept_failed(&self, _: &Arc<ReadinessAcceptor>, _: Arc<ReadinessConnection>, _: Error) {}
    }

    struct Idle;

    impl DataExchange for Idle {
        fn exchange(&self, _: &Arc<ReadinessConnection>) -> Result<usize> {
            Ok(0)
        }

        fn on_failure(&self, _: &Arc<ReadinessConnection>, _: Error) {}
    }

    #[test]
    fn test_listener_registered_for_reads_only() {
        let mut poll = Poll::new().unwrap();
        let reactor = Arc::new(Reactor::new(poll.registry().try_clone().unwrap()));
        let io: Arc<dyn AsyncIo> = reactor.clone();
        let counter = Arc::new(Counter::default());
        let acceptor = ReadinessAcceptor::new(Arc::clone(&io), loopback(0), counter.clone()).unwrap();

        assert_eq!(acceptor.interest(), Interest::READABLE);
        assert_eq!(reactor.registered(), 1);

        // An idle listener raises no events
        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());

        // Arm, connect, and let the readable event finish the accept
        let connection = ReadinessConnection::new(Arc::clone(&io), 64, Arc::new(Idle));
        assert!(!acceptor.accept_async(Arc::clone(&connection)).unwrap());
        assert!(acceptor.is_armed());

        let _client = TcpStream::connect(acceptor.local_addr().unwrap()).unwrap();
        let token = Token(acceptor.token().unwrap());
        let mut seen = false;
        for _ in 0..50 {
            poll.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
            if events.iter().any(|e| e.token() == token && e.is_readable()) {
                seen = true;
                break;
            }
        }
        assert!(seen);

        reactor.dispatch(token).unwrap();
        assert_eq!(counter.accepted.load(Ordering::SeqCst), 1);
        assert!(!connection.state().is_initial());
        assert_eq!(reactor.registered(), 2);

        connection.disconnect().unwrap();
        assert_eq!(reactor.registered(), 1);
    }
}
