use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fair FIFO concurrency limiter for node turns. Permits are granted in
/// acquisition order, so a queued waiter cannot be starved by later ones.
#[derive(Clone)]
pub struct TurnLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl TurnLimiter {
    /// `max_concurrency` is clamped to at least 1.
    pub fn new(max_concurrency: usize) -> Self {
        let max = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("turn limiter semaphore closed")
    }
}
