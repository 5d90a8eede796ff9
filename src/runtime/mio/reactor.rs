//! Readiness registration for endpoints.
//!
//! Endpoints don't talk to mio directly. Their owner hands them an
//! `AsyncIo` implementation to start and stop readiness monitoring, and the
//! event loop routes each event back through `ReadinessTarget::complete`.
//! `Reactor` is the mio-backed implementation.

use crate::error::{Error, Result};
use crate::runtime::token::TokenRegistry;
use crate::runtime::Endpoint;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Owner-supplied hooks that start and stop readiness monitoring.
pub trait AsyncIo: Send + Sync {
    /// Begin delivering readiness events for `endpoint`.
    fn start(&self, endpoint: Arc<dyn ReadinessTarget>) -> Result<()>;

    /// Stop delivering events. A no-op for endpoints that were never started.
    fn stop(&self, endpoint: &dyn ReadinessTarget) -> Result<()>;
}

/// An endpoint that reacts to readiness events.
pub trait ReadinessTarget: Endpoint {
    /// The endpoint's socket became ready. Errors are fatal to the loop.
    fn complete(self: Arc<Self>) -> Result<()>;

    /// Record the token the endpoint is registered under.
    fn attach(&self, token: usize);

    /// Forget the token, returning it if one was set.
    fn detach(&self) -> Option<usize>;

    /// Readiness the endpoint wants to hear about.
    fn interest(&self) -> Interest {
        Interest::READABLE | Interest::WRITABLE
    }
}

/// Token storage for an endpoint, settable through `&self`.
pub(crate) struct TokenSlot(AtomicUsize);

impl TokenSlot {
    const EMPTY: usize = usize::MAX;

    pub(crate) fn new() -> Self {
        TokenSlot(AtomicUsize::new(Self::EMPTY))
    }

    pub(crate) fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            Self::EMPTY => None,
            token => Some(token),
        }
    }

    pub(crate) fn set(&self, token: usize) {
        self.0.store(token, Ordering::Release);
    }

    pub(crate) fn take(&self) -> Option<usize> {
        match self.0.swap(Self::EMPTY, Ordering::AcqRel) {
            Self::EMPTY => None,
            token => Some(token),
        }
    }
}

/// mio-backed `AsyncIo`.
///
/// Registers endpoint sockets edge-triggered for the readiness each one
/// asks for, and keeps a token registry so the event loop can find the endpoint for an event.
pub struct Reactor {
    registry: Registry,
    targets: Mutex<TokenRegistry<dyn ReadinessTarget>>,
}

impl Reactor {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            targets: Mutex::new(TokenRegistry::with_capacity(64)),
        }
    }

    fn targets(&self) -> MutexGuard<'_, TokenRegistry<dyn ReadinessTarget>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of endpoints currently registered.
    pub fn registered(&self) -> usize {
        self.targets().len()
    }

    /// Route an event to its endpoint.
    pub fn dispatch(&self, token: Token) -> Result<()> {
        let target = self.targets().get(token.0);
        match target {
            Some(target) => target.complete(),
            None => {
                trace!(token = token.0, "Event for unregistered endpoint");
                Ok(())
            }
        }
    }
}

impl AsyncIo for Reactor {
    fn start(&self, endpoint: Arc<dyn ReadinessTarget>) -> Result<()> {
        let fd = endpoint.handle().ok_or(Error::NotBound)?;
        let token = self.targets().insert(Arc::downgrade(&endpoint));
        endpoint.attach(token);

        let interest = endpoint.interest();
        if let Err(e) = self
            .registry
            .register(&mut SourceFd(&fd), Token(token), interest)
        {
            self.targets().remove(token);
            endpoint.detach();
            return Err(e.into());
        }

        trace!(token, fd, "Registered");
        Ok(())
    }

    fn stop(&self, endpoint: &dyn ReadinessTarget) -> Result<()> {
        let Some(token) = endpoint.detach() else {
            return Ok(());
        };
        self.targets().remove(token);

        if let Some(fd) = endpoint.handle() {
            self.registry.deregister(&mut SourceFd(&fd))?;
        }
        trace!(token, "Deregistered");
        Ok(())
    }
}
