//! Bounded worker pool for evaluation jobs and action application.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
    #[error("submit canceled before a worker became available")]
    Canceled,
    #[error("worker pool did not drain before the deadline")]
    DrainTimeout,
}

/// Fixed-ceiling concurrent executor. `submit` blocks the caller while
/// the pool is saturated; a closed pool fails submissions with
/// [`PoolError::Closed`], which dispatch loops treat as a stop signal.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Workers currently occupied.
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Run `work` on a pool worker. Blocks until a worker frees up,
    /// `cancel` fires, or the pool closes.
    pub async fn submit<F>(&self, cancel: &CancellationToken, work: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(PoolError::Canceled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| PoolError::Closed)?
            }
        };
        // Lost the race with a concurrent close: give the permit back.
        if self.closed.load(Ordering::Acquire) {
            drop(permit);
            return Err(PoolError::Closed);
        }
        tokio::spawn(async move {
            work.await;
            drop(permit);
        });
        Ok(())
    }

    /// Close the pool to new work and wait for in-flight work to
    /// finish, up to `deadline`.
    pub async fn graceful_stop(&self, deadline: Duration) -> Result<(), PoolError> {
        self.closed.store(true, Ordering::Release);
        let drain = Arc::clone(&self.semaphore).acquire_many_owned(self.capacity as u32);
        let drained = tokio::time::timeout(deadline, drain).await;
        self.semaphore.close();
        match drained {
            Ok(_) => Ok(()),
            Err(_) => Err(PoolError::DrainTimeout),
        }
    }
}
