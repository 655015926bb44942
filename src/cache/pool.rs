//! Rebuild Worker Pool
//!
//! A fixed number of tokio workers draining a bounded queue of rebuild jobs.
//! When the queue is full the submitting task runs the job itself
//! (caller-runs), so a rebuild is never dropped and never waits for a slot.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// A unit of background work
pub type RebuildJob = BoxFuture<'static, ()>;

/// How a submitted job was executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Handed to a worker
    Queued,
    /// Queue saturated (or pool shut down): ran on the caller's task
    RanInline,
}

/// Bounded worker pool with caller-runs backpressure
#[derive(Debug)]
pub struct RebuildPool {
    sender: mpsc::Sender<RebuildJob>,
    workers: usize,
    queue_capacity: usize,
}

impl RebuildPool {
    /// Spawn `workers` workers on the current tokio runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Result<Self> {
        if workers == 0 || queue_capacity == 0 {
            return Err(Error::Config(format!(
                "rebuild pool needs at least one worker and one queue slot (workers={}, queue={})",
                workers, queue_capacity
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("rebuild pool requires a tokio runtime: {}", e)))?;

        let (sender, receiver) = mpsc::channel::<RebuildJob>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        for worker in 0..workers {
            let receiver = Arc::clone(&receiver);
            runtime.spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    let Some(job) = job else {
                        debug!(worker, "Rebuild worker stopping");
                        break;
                    };
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!(worker, "Rebuild job panicked");
                    }
                }
            });
        }

        Ok(Self {
            sender,
            workers,
            queue_capacity,
        })
    }

    /// Queue `job`, or run it here when no slot is free.
    pub async fn submit(&self, job: RebuildJob) -> Submission {
        match self.sender.try_send(job) {
            Ok(()) => Submission::Queued,
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                debug!("Rebuild queue saturated, running on caller");
                job.await;
                Submission::RanInline
            }
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.queue_capacity - self.sender.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    #[test]
    fn test_rejects_zero_sizes() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            assert!(RebuildPool::new(0, 1).is_err());
            assert!(RebuildPool::new(1, 0).is_err());
        });
    }

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(RebuildPool::new(1, 1), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_queued_job_runs_on_worker() {
        let pool = RebuildPool::new(2, 4).unwrap();
        assert_eq!(pool.workers(), 2);
        assert_eq!(pool.queue_capacity(), 4);
        let (tx, rx) = oneshot::channel();

        let submission = pool
            .submit(
                async move {
                    let _ = tx.send(42);
                }
                .boxed(),
            )
            .await;

        assert_eq!(submission, Submission::Queued);
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_saturated_queue_runs_on_caller() {
        let pool = RebuildPool::new(1, 1).unwrap();
        let gate = Arc::new(Notify::new());
        let ran = Arc::new(AtomicUsize::new(0));

        // Occupy the only worker
        let (started_tx, started_rx) = oneshot::channel();
        let blocker_gate = Arc::clone(&gate);
        pool.submit(
            async move {
                let _ = started_tx.send(());
                blocker_gate.notified().await;
            }
            .boxed(),
        )
        .await;
        started_rx.await.unwrap();

        // Fill the single queue slot
        let queued_ran = Arc::clone(&ran);
        let second = pool
            .submit(
                async move {
                    queued_ran.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .await;
        assert_eq!(second, Submission::Queued);
        assert_eq!(pool.queued(), 1);

        // No slot left: the caller runs it before submit returns
        let inline_ran = Arc::clone(&ran);
        let third = pool
            .submit(
                async move {
                    inline_ran.fetch_add(10, Ordering::SeqCst);
                }
                .boxed(),
            )
            .await;
        assert_eq!(third, Submission::RanInline);
        assert_eq!(ran.load(Ordering::SeqCst), 10);

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(1), async {
            while ran.load(Ordering::SeqCst) != 11 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_job() {
        let pool = RebuildPool::new(1, 4).unwrap();
        pool.submit(
            async {
                panic!("rebuild exploded");
            }
            .boxed(),
        )
        .await;

        let (tx, rx) = oneshot::channel();
        pool.submit(
            async move {
                let _ = tx.send(());
            }
            .boxed(),
        )
        .await;
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }
}
