//! Admission-controlled execution queue
//!
//! Bounds two things independently:
//! - concurrently executing tasks (`max_concurrency` slots)
//! - callers waiting for a slot (`max_waiting`)
//!
//! A caller arriving when the waiting room is full is rejected immediately
//! with `QueueFull`. A waiting caller not admitted within its wait budget
//! fails with `QueueWaitTimeout` and its place in line is dropped. Slots are
//! granted first-come-first-served: tokio's semaphore hands released
//! permits to the longest waiter.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::types::{GatewayError, Result};

/// Queue limits
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_concurrency: usize,
    pub max_waiting: usize,
    /// Default wait budget for [`AdmissionQueue::submit`]
    pub max_wait: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_waiting: 32,
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Bounded execution queue
pub struct AdmissionQueue {
    config: AdmissionConfig,
    slots: Arc<Semaphore>,
    waiting: AtomicUsize,
    running: AtomicUsize,
    /// Signalled whenever a running task finishes
    idle: Notify,
    admitted: AtomicU64,
    rejected_full: AtomicU64,
    timed_out: AtomicU64,
}

/// Decrements the waiting count however the wait ends
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held while a task runs; returns the slot on drop
struct RunningGuard<'a> {
    queue: &'a AdmissionQueue,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.queue.running.fetch_sub(1, Ordering::SeqCst);
        self.queue.idle.notify_waiters();
    }
}

impl AdmissionQueue {
    pub fn new(config: AdmissionConfig) -> Self {
        info!(
            max_concurrency = config.max_concurrency,
            max_waiting = config.max_waiting,
            max_wait_ms = config.max_wait.as_millis() as u64,
            "Admission queue ready"
        );
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            waiting: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            idle: Notify::new(),
            admitted: AtomicU64::new(0),
            rejected_full: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// Run `task` once a slot is free, waiting at most the default budget
    pub async fn submit<F, Fut, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.submit_with_wait(task, self.config.max_wait).await
    }

    /// Run `task` once a slot is free, waiting at most `max_wait`
    pub async fn submit_with_wait<F, Fut, T>(&self, task: F, max_wait: Duration) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.admit(max_wait).await?;
        self.running.fetch_add(1, Ordering::SeqCst);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        let _running = RunningGuard {
            queue: self,
            _permit: permit,
        };
        task().await
    }

    async fn admit(&self, max_wait: Duration) -> Result<OwnedSemaphorePermit> {
        // Free slot and nobody ahead of us
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(GatewayError::ShuttingDown),
            Err(TryAcquireError::NoPermits) => {}
        }

        let reserved = self
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                (w < self.config.max_waiting).then_some(w + 1)
            });
        if reserved.is_err() {
            self.rejected_full.fetch_add(1, Ordering::Relaxed);
            debug!(max_waiting = self.config.max_waiting, "Admission rejected, queue full");
            return Err(GatewayError::QueueFull);
        }
        let _waiting = WaitingGuard(&self.waiting);

        let started = Instant::now();
        // Dropping the acquire future on timeout removes us from the line
        match tokio::time::timeout(max_wait, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(waited_ms = started.elapsed().as_millis() as u64, "Admitted from queue");
                Ok(permit)
            }
            Ok(Err(_)) => Err(GatewayError::ShuttingDown),
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(max_wait_ms = max_wait.as_millis() as u64, "Timed out waiting for a slot");
                Err(GatewayError::QueueWaitTimeout)
            }
        }
    }

    /// Callers currently waiting for a slot
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Tasks currently executing
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop admitting. Waiting and future callers fail with `ShuttingDown`;
    /// running tasks are unaffected.
    pub fn close(&self) {
        self.slots.close();
        info!("Admission queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Wait until no task is running, up to `grace`. Returns whether the
    /// queue drained.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let idle = self.idle.notified();
            if self.running() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.running() == 0;
            }
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            running: self.running(),
            waiting: self.waiting(),
            max_concurrency: self.config.max_concurrency,
            max_waiting: self.config.max_waiting,
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub running: usize,
    pub waiting: usize,
    pub max_concurrency: usize,
    pub max_waiting: usize,
    pub admitted: u64,
    pub rejected_full: u64,
    pub timed_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use tokio_test::{assert_err, assert_ok};

    fn queue(concurrency: usize, waiting: usize, wait_ms: u64) -> Arc<AdmissionQueue> {
        Arc::new(AdmissionQueue::new(AdmissionConfig {
            max_concurrency: concurrency,
            max_waiting: waiting,
            max_wait: Duration::from_millis(wait_ms),
        }))
    }

    /// Occupy one slot until the returned sender fires
    async fn hold_slot(queue: &Arc<AdmissionQueue>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel::<()>();
        let q = Arc::clone(queue);
        tokio::spawn(async move {
            let _ = q
                .submit(|| async move {
                    let _ = rx.await;
                    Ok(())
                })
                .await;
        });
        while queue.running() == 0 {
            tokio::task::yield_now().await;
        }
        tx
    }

    #[tokio::test]
    async fn test_runs_task_and_returns_result() {
        let q = queue(2, 2, 1000);
        let value = q.submit(|| async { Ok(42) }).await;
        assert_eq!(assert_ok!(value), 42);
        assert_eq!(q.running(), 0);
        assert_eq!(q.stats().admitted, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_bounded() {
        let q = queue(3, 64, 5000);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let q = Arc::clone(&q);
                let peak = Arc::clone(&peak);
                let current = Arc::clone(&current);
                tokio::spawn(async move {
                    q.submit(|| async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert_ok!(result.unwrap());
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_rejects_when_waiting_room_full() {
        let q = queue(1, 2, 5000);
        let release = hold_slot(&q).await;

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&q);
                tokio::spawn(async move { q.submit(|| async { Ok(()) }).await })
            })
            .collect();
        while q.waiting() < 2 {
            tokio::task::yield_now().await;
        }

        // Third waiter exceeds the waiting room
        let rejected = q.submit(|| async { Ok(()) }).await;
        assert_eq!(assert_err!(rejected), GatewayError::QueueFull);

        release.send(()).unwrap();
        for waiter in futures::future::join_all(waiters).await {
            assert_ok!(waiter.unwrap());
        }
        assert_eq!(q.waiting(), 0);
    }

    #[tokio::test]
    async fn test_wait_timeout_releases_reservation() {
        let q = queue(1, 1, 30);
        let release = hold_slot(&q).await;

        let timed_out = q.submit(|| async { Ok(()) }).await;
        assert_eq!(assert_err!(timed_out), GatewayError::QueueWaitTimeout);
        assert_eq!(q.waiting(), 0);

        // The waiting room is usable again and the slot is not leaked
        release.send(()).unwrap();
        let value = q.submit_with_wait(|| async { Ok(7) }, Duration::from_secs(1)).await;
        assert_eq!(assert_ok!(value), 7);
        assert_eq!(q.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_fcfs_admission() {
        let q = queue(1, 8, 5000);
        let release = hold_slot(&q).await;
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for i in 0..4 {
            let q2 = Arc::clone(&q);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                q2.submit(|| async move {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
                .await
            }));
            // Ensure each waiter is enqueued before the next arrives
            while q.waiting() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        release.send(()).unwrap();
        futures::future::join_all(waiters).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_close_and_drain() {
        let q = queue(1, 4, 5000);
        let release = hold_slot(&q).await;

        q.close();
        let refused = q.submit(|| async { Ok(()) }).await;
        assert_eq!(assert_err!(refused), GatewayError::ShuttingDown);

        assert!(!q.drain(Duration::from_millis(20)).await);
        release.send(()).unwrap();
        assert!(q.drain(Duration::from_secs(1)).await);
    }
}
