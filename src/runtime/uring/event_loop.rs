//! Completion-model echo server.
//!
//! Wiring:
//! - one `CompletionPort` shared by a pool of worker threads
//! - one `CompletionAcceptor` always armed with a pooled connection
//! - every accepted connection reads, echoes what it read, and reads again
//!   until the peer closes, then goes back to the pool
//!
//! A failure on the acceptor is fatal: the workers stop and `wait` returns
//! the error.

use super::acceptor::{AcceptHandler, CompletionAcceptor};
use super::connection::{CompletionConnection, ConnectionHandler};
use super::port::CompletionPort;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::runtime::listener::is_transient_accept_error;
use crate::runtime::pool::ConnectionPool;
use crate::runtime::{Acceptor, Connection, Endpoint};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// State reachable from every callback.
struct Shared {
    pool: ConnectionPool<CompletionConnection>,
    port: Arc<CompletionPort>,
    accepting: AtomicBool,
    /// First error that brought the server down.
    fatal: Mutex<Option<Error>>,
}

impl Shared {
    /// Stop accepting and take the workers down, keeping the first error.
    fn fail(&self, error: Error) {
        error!(error = %error, "Acceptor failed, stopping server");
        self.accepting.store(false, Ordering::Release);
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(error);
        if let Err(e) = self.port.shutdown() {
            error!(error = %e, "Failed to stop workers");
        }
    }

    fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Arm the acceptor with the next pooled connection.
    fn accept_next(&self, acceptor: &Arc<CompletionAcceptor>) -> Result<()> {
        let connection = self.pool.get()?;
        if let Err(e) = acceptor.accept_async(Arc::clone(&connection)) {
            self.pool.release(&connection);
            return Err(e);
        }
        Ok(())
    }

    /// Drop the peer and hand the connection back once the close finishes.
    fn abandon(&self, connection: &Arc<CompletionConnection>) {
        if let Err(e) = connection.disconnect() {
            warn!(conn = ?connection.token(), error = %e, "Disconnect failed");
            connection.reset();
            self.pool.release(connection);
        }
    }
}

/// Echo behavior behind every callback.
struct EchoHandler {
    shared: Weak<Shared>,
}

impl AcceptHandler for EchoHandler {
    fn on_accept(&self, acceptor: &Arc<CompletionAcceptor>, connection: Arc<CompletionConnection>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        match acceptor.peer_info() {
            Ok(peer) => info!("{}", peer),
            Err(e) => debug!(error = %e, "Peer address unavailable"),
        }

        if shared.accepting.load(Ordering::Acquire) {
            if let Err(e) = shared.accept_next(acceptor) {
                shared.fail(e);
            }
        }

        if let Err(e) = connection.read_async() {
            warn!(conn = ?connection.token(), error = %e, "Failed to start read");
            shared.abandon(&connection);
        }
    }

    fn on_accept_failed(
        &self,
        acceptor: &Arc<CompletionAcceptor>,
        connection: Arc<CompletionConnection>,
        error: Error,
    ) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.pool.release(&connection);

        if !shared.accepting.load(Ordering::Acquire) {
            debug!("Accept cancelled");
            return;
        }

        if !is_transient_accept_error(&error) {
            shared.fail(error);
            return;
        }

        warn!(error = %error, "Accept failed");
        if let Err(e) = shared.accept_next(acceptor) {
            shared.fail(e);
        }
    }
}

impl ConnectionHandler for EchoHandler {
    fn on_read(&self, connection: &Arc<CompletionConnection>) {
        let data = connection.input_data();
        debug!(
            conn = ?connection.token(),
            bytes = data.len(),
            text = %String::from_utf8_lossy(&data),
            "Received"
        );

        if let Err(e) = connection.write_async(&data) {
            warn!(conn = ?connection.token(), error = %e, "Echo failed");
            if let Some(shared) = self.shared.upgrade() {
                shared.abandon(connection);
            }
        }
    }

    fn on_write(&self, connection: &Arc<CompletionConnection>) {
        if let Err(e) = connection.read_async() {
            warn!(conn = ?connection.token(), error = %e, "Failed to start read");
            if let Some(shared) = self.shared.upgrade() {
                shared.abandon(connection);
            }
        }
    }

    fn on_disconnect(&self, connection: &Arc<CompletionConnection>) {
        debug!(conn = ?connection.token(), "Connection recycled");
        if let Some(shared) = self.shared.upgrade() {
            shared.pool.release(connection);
        }
    }
}

/// Echo server on the completion engine.
pub struct CompletionEchoServer {
    shared: Arc<Shared>,
    port: Arc<CompletionPort>,
    acceptor: Arc<CompletionAcceptor>,
    workers: Vec<JoinHandle<()>>,
}

impl CompletionEchoServer {
    /// Bind, prefill the pool, arm the first accept and start the workers.
    pub fn start(config: &Config) -> Result<Self> {
        Self::start_on(config, config.listen_addr()?)
    }

    /// Like `start`, listening on `addr` instead of the configured address.
    pub fn start_on(config: &Config, addr: SocketAddr) -> Result<Self> {
        config.validate()?;
        let port = CompletionPort::new(config.ring_size)?;
        let buffer_size = config.buffer_size;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let handler: Arc<dyn ConnectionHandler> = Arc::new(EchoHandler {
                shared: weak.clone(),
            });
            let creator_port = Arc::clone(&port);
            Shared {
                pool: ConnectionPool::new(move || {
                    Ok(CompletionConnection::new(
                        &creator_port,
                        buffer_size,
                        Arc::clone(&handler),
                    ))
                }),
                port: Arc::clone(&port),
                accepting: AtomicBool::new(true),
                fatal: Mutex::new(None),
            }
        });
        shared.pool.prefill(config.pool_size)?;

        let handler = Arc::new(EchoHandler {
            shared: Arc::downgrade(&shared),
        });
        let acceptor = CompletionAcceptor::new(&port, addr, handler)?;
        shared.accept_next(&acceptor)?;

        let workers = port.spawn_workers(config.worker_count())?;

        info!(
            addr = %acceptor.local_addr()?,
            pool_size = config.pool_size,
            buffer_size,
            "Completion echo server listening"
        );

        Ok(Self {
            shared,
            port,
            acceptor,
            workers,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// The connection pool backing accepted peers.
    pub fn pool(&self) -> &ConnectionPool<CompletionConnection> {
        &self.shared.pool
    }

    /// Block until the worker threads exit.
    ///
    /// Returns the error that stopped the server, if one did.
    pub fn wait(mut self) -> Result<()> {
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.acceptor.close();
        match self.shared.take_fatal() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop accepting, wake the workers and wait for them.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if self.workers.is_empty() {
            return Ok(());
        }

        self.shared.accepting.store(false, Ordering::Release);
        self.acceptor.close();
        let stopped = self.port.shutdown();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("Completion echo server stopped");
        stopped
    }
}

impl Drop for CompletionEchoServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "Shutdown failed");
        }
    }
}

/// Run the completion echo server until the process exits.
pub fn run(config: Config) -> Result<()> {
    let server = CompletionEchoServer::start(&config)?;
    server.wait()
}
