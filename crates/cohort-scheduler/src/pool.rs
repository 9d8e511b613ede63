//! Bounded, non-queuing worker pool.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::trace;

use crate::error::{PoolError, SchedulerError};

/// Admits up to `capacity` concurrent executions and rejects the rest
/// immediately instead of queuing them.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One acquired execution slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    /// Create a pool with `capacity` workers.
    pub fn new(capacity: usize) -> Result<Self, SchedulerError> {
        if capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "worker pool capacity should be positive".to_string(),
            ));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently free workers.
    pub fn available_workers(&self) -> usize {
        if self.semaphore.is_closed() {
            return 0;
        }
        self.semaphore.available_permits()
    }

    /// Take a slot without waiting.
    pub fn try_acquire(&self) -> Result<WorkerSlot, PoolError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(WorkerSlot { _permit: permit }),
            Err(TryAcquireError::NoPermits) => {
                trace!(capacity = self.capacity, "all workers are busy");
                Err(PoolError::TaskRejected)
            }
            Err(TryAcquireError::Closed) => Err(PoolError::Closed),
        }
    }

    /// Run `action` on a free worker, or reject it if none is free.
    ///
    /// The slot is held until `action` finishes or is dropped.
    pub async fn invoke_on_pool<F, T>(&self, action: F) -> Result<T, PoolError>
    where
        F: Future<Output = T>,
    {
        let _slot = self.try_acquire()?;
        Ok(action.await)
    }

    /// Reject every later admission.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}
