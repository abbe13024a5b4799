//! Process-wide cap on concurrent outgoing LLM calls.
//!
//! Some upstreams (single-connection local servers, strict proxies) fall
//! over under parallel requests. All providers share one limiter; a cap
//! of `None` disables gating entirely.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared concurrency limiter handed to every provider call site.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Option<Arc<Semaphore>>,
}

impl ConcurrencyLimiter {
    /// Create a limiter with the given cap. `None` means unlimited.
    pub fn new(max_concurrent: Option<usize>) -> Self {
        ConcurrencyLimiter {
            semaphore: max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// An unlimited limiter.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Acquire a slot, waiting if the cap is reached. The returned permit
    /// releases the slot on drop; `None` when unlimited.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.semaphore {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .expect("limiter semaphore never closes"),
            ),
            None => None,
        }
    }

    /// Currently available slots, when capped.
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let limiter = ConcurrencyLimiter::unlimited();
        assert!(limiter.acquire().await.is_none());
        assert!(limiter.available().is_none());
    }

    #[tokio::test]
    async fn test_cap_enforced() {
        let limiter = ConcurrencyLimiter::new(Some(1));

        let permit = limiter.acquire().await;
        assert!(permit.is_some());
        assert_eq!(limiter.available(), Some(0));

        // Second acquire blocks until the first permit drops.
        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        let second = waiter.await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn test_zero_cap_clamped_to_one() {
        let limiter = ConcurrencyLimiter::new(Some(0));
        assert_eq!(limiter.available(), Some(1));
    }
}
