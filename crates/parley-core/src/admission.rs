//! Single-flight admission for the browser-session source.
//!
//! Waiters are served in arrival order (tokio's semaphore is fair). A waiter
//! whose client has gone is never handed the gate: cancellation is checked
//! while waiting and once more right after acquiring.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

/// Exclusive right to ask. Dropping it also releases the gate, so early
/// returns and panics cannot keep it held.
pub struct AdmissionPermit {
    permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    /// Hand the gate to the next waiter by dropping the permit.
    pub fn release(self) {
        drop(self.permit);
    }
}

struct WaitingGuard(Arc<AtomicUsize>);

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionController {
    /// `capacity` is the number of asks allowed in flight; the browser
    /// session uses 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Callers currently suspended in [`acquire`](Self::acquire).
    pub fn queue_depth(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait for the gate. Returns `None` if `cancel` fires before or right
    /// upon admission; the gate is then left free for the next waiter.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<AdmissionPermit> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let waiting = WaitingGuard(Arc::clone(&self.waiting));

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
        };
        drop(waiting);

        let permit = permit?;
        if cancel.is_cancelled() {
            tracing::debug!("client left right as it was admitted");
            drop(permit);
            return None;
        }
        Some(AdmissionPermit { permit })
    }
}
