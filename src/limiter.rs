//! Bounded-parallelism task queue.
//!
//! Tasks are spawned onto the runtime immediately but only start running once
//! they hold one of the limiter's permits. Waiters are admitted in arrival
//! order, and a finishing task hands its permit straight to the next waiter.

use crate::error::{CloneError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    limit: usize,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            running: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of tasks currently holding a permit.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Queues `task` and returns a handle resolving to its own result.
    ///
    /// A failing task never affects the others; each outcome is delivered
    /// only through its handle.
    pub fn schedule<F, T>(&self, task: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| CloneError::Task(e.to_string()))?;

            running.fetch_add(1, Ordering::SeqCst);
            let _guard = RunningGuard(running);
            task.await
        })
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
