use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::sandbox::SandboxError;

/// Bounded worker pool. Excess submissions wait in arrival order.
///
/// Backed by a tokio `Semaphore`, whose waiters are served first-in first-out.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    queue_timeout: Option<Duration>,
    running: Arc<AtomicUsize>,
    queued: AtomicUsize,
    peak_running: Arc<AtomicUsize>,
}

/// Pool utilisation at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub capacity: usize,
    pub running: usize,
    pub queued: usize,
    pub peak_running: usize,
}

/// A held slot. Releasing it admits exactly one waiter, if any.
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
    pub queue_wait: Duration,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(capacity: usize, queue_timeout: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            queue_timeout,
            running: Arc::new(AtomicUsize::new(0)),
            queued: AtomicUsize::new(0),
            peak_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a free slot, giving up after the queue timeout if one is set.
    pub async fn acquire(&self) -> Result<Slot, SandboxError> {
        let started = Instant::now();
        self.queued.fetch_add(1, Ordering::SeqCst);
        let waiting = scopeguard::guard(&self.queued, |queued| {
            queued.fetch_sub(1, Ordering::SeqCst);
        });

        let acquire = self.permits.clone().acquire_owned();
        let permit = match self.queue_timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("No execution slot freed up within {} ms", limit.as_millis());
                    return Err(SandboxError::QueueTimeout(limit.as_millis() as u64));
                }
            },
            None => acquire.await,
        }
        .map_err(|_| SandboxError::RuntimeError("worker pool is shut down".to_string()))?;
        drop(waiting);

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);
        let queue_wait = started.elapsed();
        debug!(running, queue_wait_ms = queue_wait.as_millis() as u64, "Acquired execution slot");

        Ok(Slot {
            _permit: permit,
            running: self.running.clone(),
            queue_wait,
        })
    }

    /// Runs `task` once a slot is free; the slot is released however the task ends.
    pub async fn submit<F, T>(&self, task: F) -> Result<T, SandboxError>
    where
        F: Future<Output = T>,
    {
        let _slot = self.acquire().await?;
        Ok(task.await)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            running: self.running(),
            queued: self.queued(),
            peak_running: self.peak_running.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_running_never_exceeds_capacity() {
        let pool = Arc::new(WorkerPool::new(2, None));
        let active = Arc::new(AtomicUsize::new(0));
        let observed_max = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let active = active.clone();
            let observed_max = observed_max.clone();
            handles.push(tokio::spawn(async move {
                pool.submit(async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    observed_max.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(observed_max.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.stats().peak_running, 2);
        assert_eq!(pool.running(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn test_queued_tasks_start_in_submission_order() {
        let pool = Arc::new(WorkerPool::new(1, None));
        let order = Arc::new(Mutex::new(Vec::new()));

        let (release, hold) = oneshot::channel::<()>();
        let blocker = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.submit(async {
                    let _ = hold.await;
                })
                .await
            })
        };
        while pool.running() < 1 {
            tokio::task::yield_now().await;
        }

        let mut handles = Vec::new();
        for i in 0..5 {
            let task_pool = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                task_pool.submit(async move {
                    order.lock().unwrap().push(i);
                })
                .await
            }));
            while pool.queued() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        release.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_queue_timeout_gives_up() {
        let pool = Arc::new(WorkerPool::new(1, Some(Duration::from_millis(30))));
        let held = pool.acquire().await.unwrap();

        let result = pool.submit(async { 1 }).await;
        assert!(matches!(result, Err(SandboxError::QueueTimeout(30))));
        assert_eq!(pool.queued(), 0);

        drop(held);
        assert_eq!(pool.submit(async { 2 }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_slot_released_when_task_fails() {
        let pool = WorkerPool::new(1, None);
        let failed: Result<Result<(), &str>, _> = pool.submit(async { Err("boom") }).await;
        assert!(failed.unwrap().is_err());
        assert_eq!(pool.running(), 0);
        assert_eq!(pool.submit(async { 7 }).await.unwrap(), 7);
    }
}
