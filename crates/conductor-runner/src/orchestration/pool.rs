//! Semaphore-based worker pool bounding concurrent task executions.
//!
//! The [`WorkerPool`] hands out permits via a Tokio semaphore. Acquisition can
//! be raced against a cancellation token so that tasks still queued when
//! fail-fast triggers give up instead of running.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default number of concurrently running tasks.
pub const DEFAULT_MAX_PARALLEL: usize = 3;

/// A permit granting the right to run one task.
///
/// When dropped, the permit is automatically returned to the pool.
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

/// Bounded concurrency pool for task executions.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    max_parallel: usize,
}

impl WorkerPool {
    /// Create a pool with the given limit. Zero selects the default.
    pub fn new(max_parallel: usize) -> Self {
        let limit = if max_parallel == 0 {
            DEFAULT_MAX_PARALLEL
        } else {
            max_parallel
        };

        debug!(max_parallel = limit, "WorkerPool created");

        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_parallel: limit,
        }
    }

    /// Acquire a permit, waiting until one frees up.
    pub async fn acquire(&self) -> Result<PoolPermit, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(PoolPermit { _permit: permit })
    }

    /// Acquire a permit unless `cancel` fires first.
    ///
    /// Returns `None` when canceled, including when the token was already
    /// canceled while a permit happened to be free.
    pub async fn acquire_or_cancel(&self, cancel: &CancellationToken) -> Option<PoolPermit> {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            permit = self.acquire() => permit.ok()?,
        };
        if cancel.is_cancelled() {
            info!("Cancellation observed after acquiring a pool slot");
            return None;
        }
        Some(permit)
    }

    /// Maximum concurrency limit.
    pub const fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Number of available permits (slots) remaining.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARALLEL)
    }
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The semaphore was closed (pool shut down).
    #[error("Worker pool has been closed")]
    Closed,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pool_default_concurrency() {
        let pool = WorkerPool::default();
        assert_eq!(pool.max_parallel(), DEFAULT_MAX_PARALLEL);
        assert_eq!(pool.available_permits(), DEFAULT_MAX_PARALLEL);
    }

    #[tokio::test]
    async fn pool_zero_uses_default() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.max_parallel(), DEFAULT_MAX_PARALLEL);
    }

    #[tokio::test]
    #[allow(clippy::significant_drop_tightening)]
    async fn permits_are_returned_on_drop() {
        let pool = WorkerPool::new(2);
        let permit1 = pool.acquire().await.unwrap();
        let permit2 = pool.acquire().await.unwrap();
        assert_eq!(pool.available_permits(), 0);
        drop((permit1, permit2));
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_permit() {
        let pool = WorkerPool::new(1);
        let permit = pool.acquire().await.unwrap();

        let waiter = pool.clone();
        let handle = tokio::spawn(async move {
            waiter.acquire().await.unwrap();
        });

        drop(permit);
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("acquire should complete after permit released")
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_wins_over_waiting() {
        let pool = WorkerPool::new(1);
        let _held = pool.acquire().await.unwrap();
        let cancel = CancellationToken::new();

        let waiter = pool.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { waiter.acquire_or_cancel(&token).await.is_some() });

        cancel.cancel();
        let acquired = tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!acquired);
    }

    #[tokio::test]
    async fn already_canceled_never_acquires() {
        let pool = WorkerPool::new(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(pool.acquire_or_cancel(&cancel).await.is_none());
        assert_eq!(pool.available_permits(), 4);
    }
}
