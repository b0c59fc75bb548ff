use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// Non-blocking admission over a fixed pool of slots, no queue
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
}

/// One held slot. Dropping it returns the slot on every exit path,
/// cancellation and panics included.
#[derive(Debug)]
pub struct ConcurrencySlot {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    // never waits
    pub fn try_acquire(&self) -> Option<ConcurrencySlot> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| ConcurrencySlot { _permit: permit })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max - self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn rejects_when_exhausted() {
        let limiter = ConcurrencyLimiter::new(2);

        let a = limiter.try_acquire();
        let b = limiter.try_acquire();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.in_flight(), 2);

        drop(a);
        assert_eq!(limiter.in_flight(), 1);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn slot_released_on_panic() {
        let limiter = ConcurrencyLimiter::new(1);
        let inner = limiter.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _slot = inner.try_acquire().unwrap();
            panic!("forwarding blew up");
        }));

        assert!(result.is_err());
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn slot_released_when_task_cancelled() {
        let limiter = ConcurrencyLimiter::new(1);
        let slot = limiter.try_acquire().unwrap();

        let handle = tokio::spawn(async move {
            let _slot = slot;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        tokio::task::yield_now().await;
        assert_eq!(limiter.available(), 0);

        handle.abort();
        let _ = handle.await;
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_max_under_load() {
        let limiter = ConcurrencyLimiter::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                if let Some(_slot) = limiter.try_acquire() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(admitted.load(Ordering::SeqCst) >= 1);
        // every acquire was paired with exactly one release
        assert_eq!(limiter.available(), 3);
    }
}
