//! Readiness-model echo server.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! endpoints perform non-blocking accept, read and write calls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One event loop thread owns the `Poll`. Endpoints register through the
//! `Reactor`, and a `Waker` on a reserved token interrupts the loop at
//! shutdown. A failure on the acceptor stops the loop and `wait` returns it.

use super::acceptor::{AcceptHandler, ReadinessAcceptor};
use super::connection::{DataExchange, ReadinessConnection};
use super::reactor::{AsyncIo, Reactor};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::runtime::listener::is_transient_accept_error;
use crate::runtime::pool::ConnectionPool;
use crate::runtime::{Acceptor, Connection, Endpoint, IoStatus};
use mio::{Events, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// State reachable from every callback.
struct Shared {
    pool: ConnectionPool<ReadinessConnection>,
    running: AtomicBool,
    waker: Waker,
    /// First error that brought the server down.
    fatal: Mutex<Option<Error>>,
}

impl Shared {
    /// Ask the event loop to exit.
    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        Ok(self.waker.wake()?)
    }

    /// Stop the loop, keeping the first error for `wait`.
    fn fail(&self, error: Error) {
        error!(error = %error, "Server failed, stopping");
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(error);
        if let Err(e) = self.stop() {
            error!(error = %e, "Failed to wake event loop");
        }
    }

    fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Accept every waiting peer, leaving one pooled connection armed for
    /// the next.
    fn accept_pending(&self, acceptor: &Arc<ReadinessAcceptor>) -> Result<()> {
        loop {
            let connection = self.pool.get()?;
            match acceptor.accept_async(Arc::clone(&connection)) {
                Ok(true) => log_peer(acceptor),
                Ok(false) => return Ok(()),
                Err(e) => {
                    self.pool.release(&connection);
                    return Err(e);
                }
            }
        }
    }

    /// Close the peer and return the connection to the pool.
    fn recycle(&self, connection: &Arc<ReadinessConnection>) {
        if let Err(e) = connection.disconnect() {
            debug!(conn = ?connection.token(), error = %e, "Disconnect failed");
        }
        self.pool.release(connection);
    }
}

fn log_peer(acceptor: &ReadinessAcceptor) {
    match acceptor.peer_info() {
        Ok(peer) => info!("{}", peer),
        Err(e) => debug!(error = %e, "Peer address unavailable"),
    }
}

/// Echo behavior behind every callback.
struct EchoHandler {
    shared: Weak<Shared>,
}

impl AcceptHandler for EchoHandler {
    fn on_accept(&self, acceptor: &Arc<ReadinessAcceptor>, _connection: Arc<ReadinessConnection>) {
        log_peer(acceptor);

        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Err(e) = shared.accept_pending(acceptor) {
            shared.fail(e);
        }
    }

    fn on_accept_failed(
        &self,
        acceptor: &Arc<ReadinessAcceptor>,
        connection: Arc<ReadinessConnection>,
        error: Error,
    ) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.pool.release(&connection);

        if !is_transient_accept_error(&error) {
            shared.fail(error);
            return;
        }

        warn!(error = %error, "Accept failed");
        if let Err(e) = shared.accept_pending(acceptor) {
            shared.fail(e);
        }
    }
}

impl DataExchange for EchoHandler {
    fn exchange(&self, connection: &Arc<ReadinessConnection>) -> Result<usize> {
        match connection.read_async()? {
            IoStatus::Transferred(0) => {
                debug!(conn = ?connection.token(), "Peer closed connection");
                if let Some(shared) = self.shared.upgrade() {
                    shared.recycle(connection);
                }
                Ok(0)
            }
            IoStatus::Transferred(n) => {
                let data = connection.input_data();
                debug!(
                    conn = ?connection.token(),
                    bytes = n,
                    text = %String::from_utf8_lossy(&data),
                    "Received"
                );
                connection.write_async(&data)?;
                Ok(n)
            }
            IoStatus::Pending | IoStatus::WouldBlock => Ok(0),
        }
    }

    fn on_failure(&self, connection: &Arc<ReadinessConnection>, error: Error) {
        debug!(conn = ?connection.token(), error = %error, "Exchange failed");
        if let Some(shared) = self.shared.upgrade() {
            shared.recycle(connection);
        }
    }
}

/// Echo server on the readiness engine.
pub struct ReadinessEchoServer {
    shared: Arc<Shared>,
    reactor: Arc<Reactor>,
    acceptor: Arc<ReadinessAcceptor>,
    thread: Option<JoinHandle<()>>,
}

impl ReadinessEchoServer {
    /// Bind, prefill the pool, arm the first accept and start the loop.
    pub fn start(config: &Config) -> Result<Self> {
        Self::start_on(config, config.listen_addr()?)
    }

    /// Like `start`, listening on `addr` instead of the configured address.
    pub fn start_on(config: &Config, addr: SocketAddr) -> Result<Self> {
        config.validate()?;

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let reactor = Arc::new(Reactor::new(poll.registry().try_clone()?));
        let io: Arc<dyn AsyncIo> = reactor.clone();
        let buffer_size = config.buffer_size;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let handler: Arc<dyn DataExchange> = Arc::new(EchoHandler {
                shared: weak.clone(),
            });
            let io = Arc::clone(&io);
            Shared {
                pool: ConnectionPool::new(move || {
                    Ok(ReadinessConnection::new(
                        Arc::clone(&io),
                        buffer_size,
                        Arc::clone(&handler),
                    ))
                }),
                running: AtomicBool::new(true),
                waker,
                fatal: Mutex::new(None),
            }
        });
        shared.pool.prefill(config.pool_size)?;

        let handler = Arc::new(EchoHandler {
            shared: Arc::downgrade(&shared),
        });
        let acceptor = ReadinessAcceptor::new(io, addr, handler)?;
        shared.accept_pending(&acceptor)?;

        let thread = {
            let reactor = Arc::clone(&reactor);
            let shared = Arc::clone(&shared);
            let capacity = config.event_capacity;
            thread::Builder::new()
                .name("readiness-loop".to_string())
                .spawn(move || {
                    if let Err(e) = event_loop(poll, &reactor, &shared.running, capacity) {
                        shared.fail(e);
                    }
                })?
        };

        info!(
            addr = %acceptor.local_addr()?,
            pool_size = config.pool_size,
            buffer_size,
            "Readiness echo server listening"
        );

        Ok(Self {
            shared,
            reactor,
            acceptor,
            thread: Some(thread),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// The connection pool backing accepted peers.
    pub fn pool(&self) -> &ConnectionPool<ReadinessConnection> {
        &self.shared.pool
    }

    /// Number of endpoints registered for readiness, listener included.
    pub fn registered(&self) -> usize {
        self.reactor.registered()
    }

    /// Block until the event loop exits.
    ///
    /// Returns the error that stopped the server, if one did.
    pub fn wait(mut self) -> Result<()> {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        match self.shared.take_fatal() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop the event loop and wait for it.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        let woken = self.shared.stop();
        let _ = thread.join();
        info!("Readiness echo server stopped");
        woken
    }
}

impl Drop for ReadinessEchoServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "Shutdown failed");
        }
    }
}

fn event_loop(mut poll: Poll, reactor: &Reactor, running: &AtomicBool, capacity: usize) -> Result<()> {
    let mut events = Events::with_capacity(capacity);

    while running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }

        for event in events.iter() {
            match event.token() {
                WAKE_TOKEN => {}
                token => reactor.dispatch(token)?,
            }
        }
    }

    debug!("Event loop exiting");
    Ok(())
}

/// Run the readiness echo server until the process exits.
pub fn run(config: Config) -> Result<()> {
    let server = ReadinessEchoServer::start(&config)?;
    server.wait()
}
