//! Completion port built on a shared io_uring instance.
//!
//! Endpoints bind to the port once and get a token that travels with every
//! operation they post as the SQE `user_data`. Worker threads reap
//! completions and hand each one to the endpoint that owns its token.
//!
//! The ring is shared by every worker:
//! - producers serialize on the submission lock
//! - reapers serialize on the completion lock
//! - no lock is held while an endpoint handles a completion, or while a
//!   worker is parked in the kernel

use crate::error::{Error, Result};
use crate::runtime::token::TokenRegistry;
use crate::runtime::Endpoint;
use io_uring::{opcode, squeue, IoUring};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// `user_data` of the no-op posted to wake parked workers.
const WAKE_TOKEN: u64 = u64::MAX;

/// Completions reaped per pass before dispatching.
const REAP_BATCH: usize = 64;

/// An endpoint that receives completions from the port.
pub trait CompletionTarget: Endpoint {
    /// Handle the completion of this endpoint's outstanding operation.
    ///
    /// `result` is the raw CQE result: a byte count or descriptor when
    /// non-negative, a negated errno otherwise.
    fn complete(self: Arc<Self>, result: i32);
}

/// Shared io_uring instance plus the endpoints bound to it.
pub struct CompletionPort {
    ring: IoUring,
    submit_lock: Mutex<()>,
    reap_lock: Mutex<()>,
    targets: RwLock<TokenRegistry<dyn CompletionTarget>>,
    running: AtomicBool,
}

// SAFETY: the submission queue is only touched under `submit_lock` and the
// completion queue only under `reap_lock`. Everything else the ring exposes
// (`submit`, `submit_and_wait`) is a plain `io_uring_enter` call, which the
// kernel allows from any thread.
unsafe impl Send for CompletionPort {}
unsafe impl Sync for CompletionPort {}

impl CompletionPort {
    /// Create a port with a ring of `entries` submission slots.
    pub fn new(entries: u32) -> Result<Arc<Self>> {
        let ring = IoUring::new(entries)?;
        Ok(Arc::new(Self {
            ring,
            submit_lock: Mutex::new(()),
            reap_lock: Mutex::new(()),
            targets: RwLock::new(TokenRegistry::with_capacity(entries as usize)),
            running: AtomicBool::new(true),
        }))
    }

    /// Associate an endpoint with the port and return its token.
    pub fn bind(&self, target: Weak<dyn CompletionTarget>) -> usize {
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target)
    }

    /// Release a token. Completions still in flight for it are dropped.
    pub fn unbind(&self, token: usize) {
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    /// Number of endpoints bound to the port.
    pub fn bound(&self) -> usize {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue an operation and submit it to the kernel.
    ///
    /// # Safety
    ///
    /// Every buffer and address the entry points at must stay valid and
    /// untouched until its completion is reaped.
    pub unsafe fn submit(&self, entry: &squeue::Entry) -> Result<()> {
        let _guard = self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // SAFETY: `submit_lock` makes us the only producer; entry validity is
        // the caller's contract.
        let pushed = unsafe { self.ring.submission_shared().push(entry).is_ok() };
        if !pushed {
            // Ring full: flush what is queued and retry once.
            self.ring.submit()?;
            let retried = unsafe { self.ring.submission_shared().push(entry).is_ok() };
            if !retried {
                return Err(Error::QueueFull);
            }
        }

        self.ring.submit()?;
        Ok(())
    }

    /// Spawn `count` worker threads servicing this port.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(count);

        for worker_id in 0..count {
            let port = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("completion-{}", worker_id))
                .spawn(move || {
                    if let Err(e) = port.run_worker(worker_id) {
                        error!(worker = worker_id, error = %e, "Worker failed");
                    }
                })?;
            handles.push(handle);
        }

        info!(workers = count, "Completion workers started");
        Ok(handles)
    }

    /// Reap and dispatch completions until the port shuts down.
    pub fn run_worker(&self, worker_id: usize) -> Result<()> {
        let mut batch = Vec::with_capacity(REAP_BATCH);

        while self.is_running() {
            self.reap(&mut batch);

            if batch.is_empty() {
                match self.ring.submit_and_wait(1) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    // Completion queue overflow; reap before entering again
                    Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            for (user_data, result) in batch.drain(..) {
                self.dispatch(user_data, result);
            }
        }

        debug!(worker = worker_id, "Worker exiting");
        // Pass the wake-up on to any worker still parked in the kernel.
        self.wake()
    }

    fn reap(&self, batch: &mut Vec<(u64, i32)>) {
        let _guard = self.reap_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // SAFETY: `reap_lock` makes us the only consumer of the queue.
        let cq = unsafe { self.ring.completion_shared() };
        batch.extend(cq.take(REAP_BATCH).map(|cqe| (cqe.user_data(), cqe.result())));
    }

    fn dispatch(&self, user_data: u64, result: i32) {
        if user_data == WAKE_TOKEN {
            return;
        }

        let target = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_data as usize);

        match target {
            Some(target) => target.complete(result),
            None => debug!(token = user_data, result, "Completion for unbound endpoint"),
        }
    }

    fn wake(&self) -> Result<()> {
        let nop = opcode::Nop::new().build().user_data(WAKE_TOKEN);
        // SAFETY: a no-op references no memory.
        unsafe { self.submit(&nop) }
    }

    /// Stop the workers. Each one finishes the completion it is handling,
    /// then exits.
    pub fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.wake()
    }
}

/// Whether io_uring can be used on this host.
pub fn is_supported() -> bool {
    IoUring::new(2).is_ok()
}
