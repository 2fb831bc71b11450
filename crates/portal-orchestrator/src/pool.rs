//! Worker pool: a counting semaphore over backend sessions.
//!
//! The pool never holds idle sessions. Each lease opens a fresh session
//! through the injected [`Backend`] and tears it down on release, so a
//! worker is isolated from every other unit of work. The number of
//! concurrently leased workers never exceeds the pool capacity.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::backend::{Backend, Credentials, Session};
use crate::error::{OrchestratorError, OrchestratorResult};

/// A leased handle to one backend session.
///
/// Release is idempotent. Dropping an unreleased worker returns its
/// capacity immediately and closes the session on a background task.
pub struct Worker {
    lease: u64,
    session: Option<Box<dyn Session>>,
    permit: Option<OwnedSemaphorePermit>,
    leased: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("lease", &self.lease)
            .field("released", &self.permit.is_none())
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn lease_id(&self) -> u64 {
        self.lease
    }

    /// The underlying session, or `None` once released.
    pub fn session_mut(&mut self) -> Option<&mut (dyn Session + 'static)> {
        self.session.as_deref_mut()
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }

    /// Close the session, then hand the capacity token back.
    pub async fn release(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!("worker {} session close failed: {e:#}", self.lease);
            }
        }
        if let Some(permit) = self.permit.take() {
            self.leased.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            debug!("worker {} released", self.lease);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let lease = self.lease;
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        warn!("worker {lease} session close failed: {e:#}");
                    }
                });
            }
        }
        if let Some(permit) = self.permit.take() {
            self.leased.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }
    }
}

/// Fixed-capacity pool of backend workers.
pub struct WorkerPool {
    backend: Arc<dyn Backend>,
    credentials: Option<Credentials>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    leased: Arc<AtomicUsize>,
    peak: AtomicUsize,
    next_lease: AtomicU64,
}

impl WorkerPool {
    pub fn new(backend: Arc<dyn Backend>, capacity: usize, credentials: Option<Credentials>) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            backend,
            credentials,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            leased: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            next_lease: AtomicU64::new(1),
        }
    }

    /// Wait up to `deadline` for capacity, then open a session.
    ///
    /// Fails with `AcquireTimeout` when the pool stays saturated and with
    /// `Backend` when the session cannot be opened. In both cases no
    /// capacity is retained.
    pub async fn acquire(&self, deadline: Duration) -> OrchestratorResult<Worker> {
        let permit = match tokio::time::timeout(deadline, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(OrchestratorError::FatalExecution(
                    "worker pool is closed".into(),
                ))
            }
            Err(_) => {
                warn!(
                    "worker pool saturated ({} of {} leased) for {}ms",
                    self.in_use(),
                    self.capacity,
                    deadline.as_millis()
                );
                return Err(OrchestratorError::AcquireTimeout(deadline));
            }
        };

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let leased = self.leased.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(leased, Ordering::SeqCst);

        // From here the worker owns the permit, so any early return releases it.
        let mut worker = Worker {
            lease,
            session: None,
            permit: Some(permit),
            leased: Arc::clone(&self.leased),
        };

        match self.backend.open_session(self.credentials.as_ref()).await {
            Ok(session) => {
                worker.session = Some(session);
                debug!("worker {lease} leased from {}", self.backend.name());
                Ok(worker)
            }
            Err(e) => {
                worker.release().await;
                Err(OrchestratorError::Backend(format!(
                    "{} could not open a session: {e:#}",
                    self.backend.name()
                )))
            }
        }
    }

    /// Return a worker to the pool. Safe to call more than once.
    pub async fn release(&self, worker: &mut Worker) {
        worker.release().await;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Workers currently leased.
    pub fn in_use(&self) -> usize {
        self.leased.load(Ordering::SeqCst)
    }

    /// Capacity tokens not currently leased.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Highest number of simultaneously leased workers observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}
