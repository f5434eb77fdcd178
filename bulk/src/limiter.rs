use std::sync::Arc;

use tokio::select;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Counted permits gating the number of batches in flight against one
/// partition range.
///
/// Dispatchers take one permit per batch and hold it as a guard, so release
/// happens on every path. The congestion controller moves the budget:
/// `release` grows it, `seize` shrinks it by acquiring permits and
/// forgetting them, which lets in-flight batches finish while new dispatches
/// queue.
pub(crate) struct PermitLimiter {
    semaphore: Arc<Semaphore>,
}

impl PermitLimiter {
    pub(crate) fn new(initial_permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(initial_permits)),
        }
    }

    pub(crate) async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, Error> {
        select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_closed| Error::Cancelled)
            }
        }
    }

    pub(crate) fn release(&self, permits: usize) {
        self.semaphore.add_permits(permits);
    }

    /// Permanently removes `permits` from the budget, waiting until that
    /// many are not held by dispatchers. Returns false if cancelled first.
    pub(crate) async fn seize(&self, permits: u32, cancel: &CancellationToken) -> bool {
        select! {
            _ = cancel.cancelled() => false,
            acquired = Arc::clone(&self.semaphore).acquire_many_owned(permits) => {
                match acquired {
                    Ok(acquired) => {
                        acquired.forget();
                        true
                    }
                    Err(_closed) => false,
                }
            }
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Fails all pending and future acquires. Used at executor shutdown.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_consumes_one_and_guard_releases() {
        let limiter = PermitLimiter::new(2);
        let cancel = CancellationToken::new();
        let permit = limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.available(), 1);
        drop(permit);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn seize_shrinks_budget_and_release_restores() {
        let limiter = PermitLimiter::new(5);
        let cancel = CancellationToken::new();
        assert!(limiter.seize(3, &cancel).await);
        assert_eq!(limiter.available(), 2);
        limiter.release(3);
        assert_eq!(limiter.available(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn seize_waits_for_in_flight_permits() {
        let limiter = Arc::new(PermitLimiter::new(1));
        let cancel = CancellationToken::new();
        let held = limiter.acquire(&cancel).await.unwrap();

        let seizer = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.seize(1, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!seizer.is_finished());

        drop(held);
        assert!(seizer.await.unwrap());
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn acquire_observes_cancellation_and_close() {
        let limiter = PermitLimiter::new(0);
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(limiter.acquire(&cancelled).await, Err(Error::Cancelled)));

        let cancel = CancellationToken::new();
        limiter.close();
        assert!(matches!(limiter.acquire(&cancel).await, Err(Error::Cancelled)));
    }
}
