//! Async mutual exclusion over a single semaphore permit.

use std::future::Future;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::trace;
use uuid::Uuid;

/// Error returned by [`AsyncMutex::lock`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutexError {
    #[error("mutex {0} is closed")]
    Closed(Uuid),
}

/// Serializes critical sections across concurrent tasks.
///
/// Waiting callers are suspended, not blocked, and acquire the lock in FIFO
/// order. The permit is released on every exit path of the protected action,
/// including a panic.
///
/// The mutex is **not reentrant**. Calling [`lock`](Self::lock) on the same
/// instance from inside a protected action deadlocks:
///
/// ```rust,ignore
/// mutex.lock(|| async {
///     mutex.lock(|| async {}).await // never completes
/// }).await;
/// ```
#[derive(Debug)]
pub struct AsyncMutex {
    id: Uuid,
    semaphore: Semaphore,
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncMutex {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            semaphore: Semaphore::new(1),
        }
    }

    /// Diagnostic identifier. Not used for locking.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run `action` while holding the lock and return its output.
    ///
    /// When `T` is a `Result`, an error from `action` is handed back as-is
    /// after the lock has been released.
    pub async fn lock<F, Fut, T>(&self, action: F) -> Result<T, MutexError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| MutexError::Closed(self.id))?;
        trace!(mutex = %self.id, "Lock acquired");

        let output = action().await;

        trace!(mutex = %self.id, "Lock released");
        Ok(output)
    }

    /// Returns true while some caller holds the lock.
    pub fn is_locked(&self) -> bool {
        !self.semaphore.is_closed() && self.semaphore.available_permits() == 0
    }

    /// Refuse all future [`lock`](Self::lock) calls.
    ///
    /// A caller already inside the critical section finishes normally;
    /// callers still waiting get [`MutexError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_returns_action_output() {
        let mutex = AsyncMutex::new();
        let out = mutex.lock(|| async { 7 }).await.unwrap();
        assert_eq!(out, 7);
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_action_error_is_propagated_and_lock_released() {
        let mutex = AsyncMutex::new();
        let out: Result<(), String> = mutex
            .lock(|| async { Err("bad input".to_string()) })
            .await
            .unwrap();
        assert_eq!(out, Err("bad input".to_string()));

        // Lock is free again.
        assert_eq!(mutex.lock(|| async { 1 }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lock_released_after_panic() {
        let mutex = Arc::new(AsyncMutex::new());

        let m = mutex.clone();
        let result = tokio::spawn(async move {
            m.lock(|| async {
                panic!("inside critical section");
            })
            .await
        })
        .await;
        assert!(result.is_err());

        let out = tokio::time::timeout(Duration::from_secs(1), mutex.lock(|| async { "free" }))
            .await
            .expect("lock should be free after a panic")
            .unwrap();
        assert_eq!(out, "free");
    }

    #[tokio::test]
    async fn test_closed_mutex_rejects_lock() {
        let mutex = AsyncMutex::new();
        mutex.close();
        assert!(mutex.is_closed());

        let err = mutex.lock(|| async {}).await.unwrap_err();
        assert_eq!(err, MutexError::Closed(mutex.id()));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(AsyncMutex::new().id(), AsyncMutex::new().id());
    }
}
