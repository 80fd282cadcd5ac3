use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{CodeboxError, Result};

/// Bounds the number of VMs booted at once across the process.
#[derive(Debug, Clone)]
pub struct VmSlots {
    semaphore: Arc<Semaphore>,
    queue_timeout: Duration,
}

impl VmSlots {
    pub fn new(max_parallel: usize, queue_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            queue_timeout,
        }
    }

    /// Wait for a slot, giving up after the queue timeout. The slot is
    /// released when the permit is dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        debug!(available = self.semaphore.available_permits(), "Waiting for VM slot");
        match tokio::time::timeout(self.queue_timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(CodeboxError::internal("VM slot limiter closed")),
            Err(_) => Err(CodeboxError::resource_exceeded(format!(
                "waiting for VM slot: no slot within {:?}",
                self.queue_timeout
            ))),
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slots_block_then_time_out() {
        let slots = VmSlots::new(1, Duration::from_millis(100));
        let first = slots.acquire().await.unwrap();
        assert_eq!(slots.available(), 0);

        let err = slots.acquire().await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ResourceExceeded);

        drop(first);
        let _again = slots.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_parallel_means_one() {
        let slots = VmSlots::new(0, Duration::from_millis(10));
        assert_eq!(slots.available(), 1);
    }
}
