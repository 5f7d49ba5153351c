//! Concurrency coordinator (C4): a counted semaphore gating simultaneous
//! external-process invocations (fetch/transcode). Built on
//! `tokio::sync::Semaphore`, whose `Drop`-based permit release already gives
//! us "released on every exit path including panic/cancellation" for free.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::errors::AppError;

pub struct ConcurrencyCoordinator {
    semaphore: Arc<Semaphore>,
    total_permits: usize,
    disposed: AtomicBool,
}

/// A borrowed slot. Dropping it (including via unwind during a panic) always
/// returns the permit to the coordinator.
pub struct Permit<'a> {
    _inner: SemaphorePermit<'a>,
}

impl ConcurrencyCoordinator {
    /// `max` is floored to 1 (spec §4.1 / §6 `max_concurrent_downloads`).
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            total_permits: max,
            disposed: AtomicBool::new(false),
        }
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit<'_>, AppError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AppError::Disposed);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            permit = self.semaphore.acquire() => {
                let permit = permit.map_err(|_| AppError::Disposed)?;
                Ok(Permit { _inner: permit })
            }
        }
    }

    /// Scoped acquisition: acquire, run `op`, release on every exit path.
    /// Cancellation before acquiring aborts without ever calling `op`.
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, AppError>>,
    {
        let _permit = self.acquire(cancel).await?;
        op().await
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }

    pub fn total_permits(&self) -> usize {
        self.total_permits
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn held_permits(&self) -> usize {
        self.total_permits.saturating_sub(self.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_configured_concurrency() {
        let coordinator = Arc::new(ConcurrencyCoordinator::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coordinator = coordinator.clone();
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let _permit = coordinator.acquire(&cancel).await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_observed.load(Ordering::SeqCst) <= 2);
        assert_eq!(coordinator.available_permits(), 2);
    }

    #[tokio::test]
    async fn cancellation_before_acquire_never_takes_a_permit() {
        let coordinator = ConcurrencyCoordinator::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = coordinator.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert_eq!(coordinator.available_permits(), 1);
    }

    #[tokio::test]
    async fn permit_is_released_on_panic_unwind() {
        let coordinator = Arc::new(ConcurrencyCoordinator::new(1));
        let cancel = CancellationToken::new();

        let coordinator_clone = coordinator.clone();
        let handle = tokio::spawn(async move {
            let _permit = coordinator_clone.acquire(&cancel).await.unwrap();
            panic!("boom");
        });
        let _ = handle.await;

        assert_eq!(coordinator.available_permits(), 1);
    }

    #[tokio::test]
    async fn disposed_coordinator_rejects_new_acquisitions() {
        let coordinator = ConcurrencyCoordinator::new(1);
        coordinator.dispose();
        let cancel = CancellationToken::new();
        let err = coordinator.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Disposed));
    }
}
